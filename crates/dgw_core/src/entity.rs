//! Runtime state of one endpoint in one direction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dgw_entity::{Direction, EntityInfo, EntityKey, EntityType};
use parking_lot::{Mutex, MutexGuard};

use crate::channel::ChannelState;
use crate::data_obj::DataObj;
use crate::driver::Drivers;
use crate::fsm::FsmState;
use crate::mbuf::Mbuf;

/// Whether the driver delivers events for this entity's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Resumed,
    Paused,
}

#[derive(Debug)]
pub struct Entity {
    info: EntityInfo,
    key: EntityKey,
    state: FsmState,
    /// In-flight messages of a route source, oldest first.
    pub(crate) send_list: VecDeque<DataObj>,
    /// Completed channel receives waiting to be dispatched.
    pub(crate) recv_list: VecDeque<Mbuf>,
    subscription: Subscription,
    channel: Option<ChannelState>,
    schedule_count: u64,
    /// Recipient whose capacity put this source into FULL.
    pub(crate) blocked_on: Option<EntityKey>,
}

impl Entity {
    /// Sources start IDLE, destinations start WAIT_PUSH.
    #[must_use]
    pub fn new(info: EntityInfo, direction: Direction) -> Self {
        let state = match direction {
            Direction::Send => FsmState::Idle,
            Direction::Recv => FsmState::WaitPush,
        };
        Self {
            key: info.key(direction),
            info,
            state,
            send_list: VecDeque::new(),
            recv_list: VecDeque::new(),
            subscription: Subscription::Resumed,
            channel: None,
            schedule_count: 0,
            blocked_on: None,
        }
    }

    #[must_use]
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        self.key
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.key.endpoint.entity_type
    }

    #[must_use]
    pub fn cur_state(&self) -> FsmState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FsmState) {
        self.state = state;
    }

    #[must_use]
    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    pub(crate) fn set_subscription(&mut self, subscription: Subscription) {
        self.subscription = subscription;
    }

    /// Messages delivered to completion from this source.
    #[must_use]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count
    }

    pub(crate) fn count_scheduled(&mut self) {
        self.schedule_count += 1;
    }

    #[must_use]
    pub fn send_list_len(&self) -> usize {
        self.send_list.len()
    }

    #[must_use]
    pub fn recv_list_len(&self) -> usize {
        self.recv_list.len()
    }

    #[must_use]
    pub fn blocked_on(&self) -> Option<EntityKey> {
        self.blocked_on
    }

    /// The head message is parked on a dynamic decision.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.send_list
            .front()
            .is_some_and(|obj| obj.awaiting().is_some())
    }

    #[must_use]
    pub fn channel(&self) -> Option<&ChannelState> {
        self.channel.as_ref()
    }

    /// Transport state of a channel entity, created on first use. `None`
    /// for queues and groups.
    pub fn channel_mut(&mut self, drivers: &Drivers) -> Option<&mut ChannelState> {
        let desc = self.info.channel?;
        Some(
            self.channel
                .get_or_insert_with(|| ChannelState::new(desc, drivers)),
        )
    }

    /// Aborts every in-flight message and frees every held buffer.
    pub(crate) fn abort_in_flight(&mut self, drivers: &Drivers) -> usize {
        let aborted = self.send_list.len();
        for mut obj in self.send_list.drain(..) {
            obj.abort();
        }
        for mbuf in self.recv_list.drain(..) {
            drivers.pool.free(mbuf);
        }
        if let Some(mut channel) = self.channel.take() {
            channel.uninit();
        }
        aborted
    }
}

/// A registry slot: the entity behind its lock, plus the reference count
/// kept outside the lock so the registry never locks an entity.
#[derive(Debug)]
pub struct EntitySlot {
    key: EntityKey,
    refs: AtomicUsize,
    entity: Mutex<Entity>,
}

pub type EntityHandle = Arc<EntitySlot>;

impl EntitySlot {
    #[must_use]
    pub fn new(entity: Entity) -> Self {
        Self {
            key: entity.key(),
            refs: AtomicUsize::new(1),
            entity: Mutex::new(entity),
        }
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Locks the entity. A send-side entity is always locked before any
    /// recv-side entity.
    pub fn lock(&self) -> MutexGuard<'_, Entity> {
        self.entity.lock()
    }

    #[must_use]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference and returns how many remain.
    pub(crate) fn release(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDrivers;
    use dgw_entity::ChannelDesc;

    #[test]
    fn test_initial_state_depends_on_direction() {
        let info = EntityInfo::queue(0, 1);
        assert_eq!(Entity::new(info.clone(), Direction::Send).cur_state(), FsmState::Idle);
        assert_eq!(Entity::new(info, Direction::Recv).cur_state(), FsmState::WaitPush);
    }

    #[test]
    fn test_channel_state_only_for_channels() {
        let sim = SimDrivers::new(1);
        let drivers = sim.drivers();
        let mut queue = Entity::new(EntityInfo::queue(0, 1), Direction::Send);
        assert!(queue.channel_mut(&drivers).is_none());
        let desc = ChannelDesc {
            comm_handle: 1,
            local_tag_id: 1,
            peer_tag_id: 1,
            local_rank_id: 0,
            peer_rank_id: 1,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        };
        let mut chan = Entity::new(EntityInfo::channel(0, 2, desc), Direction::Send);
        assert_eq!(chan.channel_mut(&drivers).unwrap().cap(), 2);
    }

    #[test]
    fn test_slot_refcount() {
        let slot = EntitySlot::new(Entity::new(EntityInfo::queue(0, 1), Direction::Recv));
        assert_eq!(slot.acquire(), 2);
        assert_eq!(slot.release(), 1);
        assert_eq!(slot.release(), 0);
        assert_eq!(slot.release(), 0);
    }
}
