//! Entity state machine.
//!
//! Every entity is driven by three messages. `PUSH` asks a source to move
//! one message towards its recipients, `F2NF` reports that a full recipient
//! has room again, and `RECOVER` clears a fault. Transitions form an
//! exhaustive table; a pair the table does not name is rejected with
//! [`RouterError::Failed`] and changes nothing.
//!
//! Entering a state runs its entry logic at once: a source goes
//! `IDLE → PEEK → TRY_PUSH → PUSH → IDLE` within one `PUSH` when every
//! recipient accepts, and stops in `FULL`, `ERROR` or a parked `TRY_PUSH`
//! otherwise.

use dgw_entity::{Direction, EndpointId, EntityKey, EntityType, RouterError, RouterResult};
use dgw_wire::{DecisionRequest, DecisionResponse};
use tracing::{debug, error, warn};

use crate::bind_relation::RelationGraph;
use crate::channel::SendOutcome;
use crate::data_obj::{AwaitedDecision, DataObj, DataObjManager, Delivery};
use crate::driver::{DriverError, Drivers, SubscribeKind};
use crate::dynamic::DynamicClient;
use crate::entity::{Entity, Subscription};
use crate::registry::EntityRegistry;
use crate::stats::RouterStats;
use crate::strategy::{self, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmState {
    Idle,
    Peek,
    /// Delivering the head message; parked while it awaits a decision.
    TryPush,
    Push,
    WaitPush,
    Full,
    Error,
}

impl FsmState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Peek => "PEEK",
            Self::TryPush => "TRY_PUSH",
            Self::Push => "PUSH",
            Self::WaitPush => "WAIT_PUSH",
            Self::Full => "FULL",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmMessage {
    Push,
    /// Full-to-not-full.
    F2nf,
    Recover,
}

/// What happened to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    /// The recipient has no room.
    DestFull,
    /// The recipient faulted or is gone; it is skipped for this message.
    Aborted,
    /// The source itself cannot continue.
    SourceFault,
}

/// Everything a transition may touch, borrowed for one pass.
pub struct Fsm<'a> {
    pub registry: &'a EntityRegistry,
    /// Committed relation snapshot of the current pass.
    pub graph: &'a RelationGraph,
    pub drivers: &'a Drivers,
    pub data_objs: &'a DataObjManager,
    pub dynamic: &'a DynamicClient,
    pub stats: &'a RouterStats,
}

impl Fsm<'_> {
    /// Applies `msg` to `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Failed`] for a pair outside the transition
    /// table, or the error that moved the entity to `ERROR`.
    pub fn process_message(&self, entity: &mut Entity, msg: FsmMessage) -> RouterResult<()> {
        let state = entity.cur_state();
        let result = match (state, msg) {
            (FsmState::Idle, FsmMessage::Push) => match entity.direction() {
                Direction::Send => self.on_idle_push(entity),
                Direction::Recv => {
                    entity.set_state(FsmState::WaitPush);
                    Ok(())
                }
            },
            (FsmState::Peek, FsmMessage::Push) => self.change_state(entity, FsmState::Peek),
            (FsmState::TryPush, FsmMessage::Push) => {
                if entity.is_parked() && !self.is_stale(entity) {
                    Ok(())
                } else {
                    self.change_state(entity, FsmState::TryPush)
                }
            }
            // Nothing to push into a destination; a full source keeps its
            // pending data until relief.
            (FsmState::WaitPush | FsmState::Full, FsmMessage::Push) => Ok(()),
            (FsmState::Full, FsmMessage::F2nf) => {
                self.on_relief(entity);
                Ok(())
            }
            (FsmState::Error, FsmMessage::Recover) => {
                entity.set_state(FsmState::Idle);
                Ok(())
            }
            _ => Err(RouterError::Failed),
        };
        if entity.cur_state() != state {
            debug!(entity = %entity.key(), from = %state, to = %entity.cur_state(), ?msg, "state changed");
        }
        result
    }

    /// Enters `target`, running its entry logic.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the entity to `ERROR`.
    pub fn change_state(&self, entity: &mut Entity, target: FsmState) -> RouterResult<()> {
        match target {
            FsmState::Peek => self.enter_peek(entity),
            FsmState::TryPush => self.enter_try_push(entity),
            FsmState::Push => {
                self.enter_push(entity);
                Ok(())
            }
            FsmState::Idle | FsmState::WaitPush | FsmState::Full | FsmState::Error => {
                entity.set_state(target);
                Ok(())
            }
        }
    }

    fn on_idle_push(&self, entity: &mut Entity) -> RouterResult<()> {
        if entity.send_list.is_empty()
            && let Err(err) = self.fill(entity)
        {
            self.fault(entity, err);
            return Err(err);
        }
        if entity.send_list.is_empty() {
            return Ok(());
        }
        self.change_state(entity, FsmState::Peek)
    }

    fn on_relief(&self, entity: &mut Entity) {
        match entity.direction() {
            Direction::Recv => entity.set_state(FsmState::WaitPush),
            Direction::Send => {
                entity.blocked_on = None;
                self.set_subscription(entity, Subscription::Resumed);
                let next = if entity.send_list.is_empty() {
                    FsmState::Idle
                } else {
                    FsmState::Peek
                };
                entity.set_state(next);
            }
        }
    }

    fn fault(&self, entity: &mut Entity, err: RouterError) {
        error!(entity = %entity.key(), state = %entity.cur_state(), %err, "entity faulted");
        self.stats.record_fault();
        entity.set_state(FsmState::Error);
    }

    // ── Entry logic ─────────────────────────────────────────────────────────

    fn enter_peek(&self, entity: &mut Entity) -> RouterResult<()> {
        if entity.send_list.is_empty() {
            entity.set_state(FsmState::Idle);
            return Ok(());
        }
        entity.set_state(FsmState::Peek);
        if entity.entity_type() == EntityType::Queue
            && let Err(err) = self.drivers.queues.status(entity.key().endpoint)
        {
            warn!(entity = %entity.key(), %err, "source readiness query failed");
            let err = RouterError::from(err);
            self.fault(entity, err);
            return Err(err);
        }
        self.change_state(entity, FsmState::TryPush)
    }

    fn enter_try_push(&self, entity: &mut Entity) -> RouterResult<()> {
        entity.set_state(FsmState::TryPush);
        if self.is_stale(entity) {
            self.rerequest(entity);
        }
        let src = entity.key();
        let Some(head) = entity.send_list.front_mut() else {
            entity.set_state(FsmState::Idle);
            return Ok(());
        };
        for key in head.pending() {
            match self.deliver(head, key) {
                Outcome::Delivered => {
                    head.mark(key, Delivery::Delivered);
                    self.stats.record_delivery();
                    debug!(entity = %src, recipient = %key, trans_id = head.trans_id(), "delivered");
                }
                Outcome::Aborted => {
                    head.mark(key, Delivery::Aborted);
                    self.stats.record_abort();
                }
                Outcome::DestFull => {
                    self.stats.record_dest_full();
                    self.registry.mark_full(key.resource_index() as usize);
                    entity.blocked_on = Some(key);
                    entity.set_state(FsmState::Full);
                    self.set_subscription(entity, Subscription::Paused);
                    debug!(entity = %src, recipient = %key, "recipient full");
                    return Ok(());
                }
                Outcome::SourceFault => {
                    self.fault(entity, RouterError::InnerError);
                    return Err(RouterError::InnerError);
                }
            }
        }
        if head.is_complete() {
            self.change_state(entity, FsmState::Push)
        } else {
            Ok(())
        }
    }

    fn enter_push(&self, entity: &mut Entity) {
        entity.set_state(FsmState::Push);
        if let Some(mut obj) = entity.send_list.pop_front() {
            obj.release();
            entity.count_scheduled();
        }
        let next = if entity.send_list.is_empty() {
            FsmState::Idle
        } else {
            FsmState::Peek
        };
        entity.set_state(next);
    }

    // ── Fill ────────────────────────────────────────────────────────────────

    /// Takes one buffer from the source and resolves its recipients.
    fn fill(&self, entity: &mut Entity) -> RouterResult<()> {
        let src = entity.key();
        let mbuf = match src.endpoint.entity_type {
            EntityType::Queue => match self.drivers.queues.dequeue(src.endpoint) {
                Ok(mbuf) => mbuf,
                Err(err) => {
                    warn!(entity = %src, %err, "dequeue failed");
                    return Err(err.into());
                }
            },
            EntityType::Channel => entity.recv_list.pop_front(),
            EntityType::Group => None,
        };
        let Some(mbuf) = mbuf else {
            return Ok(());
        };
        self.stats.record_dequeue();
        let mut obj = match self.data_objs.create(src, mbuf) {
            Ok(obj) => obj,
            Err(err) => {
                warn!(entity = %src, %err, "dropping message with unreadable header");
                self.stats.record_unroutable();
                return Ok(());
            }
        };
        self.resolve(entity, &mut obj)?;
        if obj.is_complete() {
            debug!(entity = %src, trans_id = obj.trans_id(), "message has no recipient");
            self.stats.record_unroutable();
            return Ok(());
        }
        entity.send_list.push_back(obj);
        Ok(())
    }

    fn resolve(&self, entity: &Entity, obj: &mut DataObj) -> RouterResult<()> {
        let src = entity.key();
        if !self.registry.has_groups() {
            let recipients = self
                .graph
                .dsts_of(src.endpoint)
                .map(|dst| dst.with_direction(Direction::Recv))
                .collect();
            return obj.set_recipients(recipients);
        }
        let mut recipients = Vec::new();
        let mut deferred = None;
        for dst in self.graph.dsts_of(src.endpoint) {
            if !dst.is_group() {
                recipients.push(dst.with_direction(Direction::Recv));
                continue;
            }
            let Some(group) = self.graph.group(dst.id) else {
                warn!(entity = %src, group_id = dst.id, "route to unknown group");
                continue;
            };
            match strategy::search(group, obj.trans_id()) {
                Ok(Selection::Members(members)) => recipients.extend(
                    members
                        .into_iter()
                        .map(|m: EndpointId| m.with_direction(Direction::Recv)),
                ),
                Ok(Selection::Deferred) if deferred.is_none() => {
                    deferred = self.request_decision(entity, group.id, obj.trans_id());
                }
                Ok(Selection::Deferred) => {
                    warn!(entity = %src, group_id = group.id, "second dynamic group skipped");
                }
                Err(err) => {
                    debug!(entity = %src, group_id = group.id, trans_id = obj.trans_id(), %err, "no member selected");
                }
            }
        }
        obj.set_recipients(recipients)?;
        if let Some(decision) = deferred {
            obj.defer(decision);
        }
        Ok(())
    }

    // ── Dynamic decisions ───────────────────────────────────────────────────

    fn request_decision(&self, entity: &Entity, group_id: u32, trans_id: u64) -> Option<AwaitedDecision> {
        let info = entity.info();
        let (Some(sched_key), Some(src_global_id)) = (info.sched_key, info.global_id) else {
            warn!(entity = %entity.key(), group_id, "dynamic route from a source without schedule identity");
            return None;
        };
        let request = DecisionRequest {
            sched_key,
            src_global_id,
            group_id,
            trans_id,
            resource_index: entity.key().resource_index(),
        };
        match self.dynamic.request(&request) {
            Ok(generation) => {
                self.stats.record_decision_request();
                Some(AwaitedDecision {
                    sched_key,
                    group_id,
                    generation,
                })
            }
            Err(err) => {
                warn!(entity = %entity.key(), group_id, %err, "decision request failed");
                None
            }
        }
    }

    /// The head awaits a decision from a schedule generation that was
    /// restarted since.
    fn is_stale(&self, entity: &Entity) -> bool {
        entity
            .send_list
            .front()
            .and_then(DataObj::awaiting)
            .is_some_and(|a| a.generation < self.dynamic.generation(a.sched_key))
    }

    fn rerequest(&self, entity: &mut Entity) {
        let Some(awaited) = entity.send_list.front().and_then(DataObj::awaiting) else {
            return;
        };
        let Some(trans_id) = entity.send_list.front().map(DataObj::trans_id) else {
            return;
        };
        let renewed = self.request_decision(entity, awaited.group_id, trans_id);
        if let Some(head) = entity.send_list.front_mut() {
            match renewed {
                Some(decision) => head.defer(decision),
                None => {
                    head.abandon_decision(awaited.group_id);
                }
            }
        }
    }

    /// Hands a decision to the message waiting for it and returns the
    /// source that took it. Duplicates and answers nobody waits for are
    /// dropped.
    pub fn apply_decision(&self, response: &DecisionResponse) -> Option<EntityKey> {
        let Some(src) = self
            .registry
            .by_global_id(response.sched_key, response.src_global_id, Direction::Send)
        else {
            warn!(sched_key = response.sched_key, src = response.src_global_id, "decision for unknown source");
            return None;
        };
        let Some(group) = self.graph.group(response.group_id) else {
            warn!(group_id = response.group_id, "decision for unknown group");
            return None;
        };
        let healthy = group.healthy();
        let Some(member) = healthy.get(response.member_index as usize) else {
            error!(
                group_id = group.id,
                member_index = response.member_index,
                members = healthy.len(),
                "decision index out of range"
            );
            return None;
        };
        let member = member.endpoint.with_direction(Direction::Recv);
        let slot = self.registry.get(&src)?;
        let mut entity = slot.lock();
        let injected = entity
            .send_list
            .iter_mut()
            .find(|obj| obj.awaiting().is_some_and(|a| a.group_id == response.group_id))
            .is_some_and(|obj| obj.inject_decision(response.group_id, member));
        if !injected {
            debug!(entity = %src, group_id = group.id, "duplicate decision ignored");
            return None;
        }
        self.stats.record_decision_injected();
        debug!(entity = %src, group_id = group.id, recipient = %member, "decision injected");
        Some(src)
    }

    // ── Delivery ────────────────────────────────────────────────────────────

    fn deliver(&self, obj: &DataObj, key: EntityKey) -> Outcome {
        let Some(slot) = self.registry.get(&key) else {
            debug!(recipient = %key, "recipient gone");
            return Outcome::Aborted;
        };
        let mut recipient = slot.lock();
        match recipient.cur_state() {
            FsmState::Error => return Outcome::Aborted,
            FsmState::Full => return Outcome::DestFull,
            _ => {}
        }
        match key.endpoint.entity_type {
            EntityType::Queue => {
                let mbuf = match obj.share() {
                    Ok(mbuf) => mbuf,
                    Err(err) => {
                        warn!(obj = obj.id(), %err, "message buffer not shareable");
                        return Outcome::SourceFault;
                    }
                };
                match self.drivers.queues.enqueue(key.endpoint, mbuf) {
                    Ok(()) => Outcome::Delivered,
                    Err((DriverError::Full, mbuf)) => {
                        self.drivers.pool.free(mbuf);
                        recipient.set_state(FsmState::Full);
                        Outcome::DestFull
                    }
                    Err((err, mbuf)) => {
                        self.drivers.pool.free(mbuf);
                        self.fault(&mut recipient, err.into());
                        Outcome::Aborted
                    }
                }
            }
            EntityType::Channel => {
                let Some(channel) = recipient.channel_mut(self.drivers) else {
                    return Outcome::Aborted;
                };
                match channel.send(obj) {
                    SendOutcome::Sent => Outcome::Delivered,
                    SendOutcome::DestFull => {
                        recipient.set_state(FsmState::Full);
                        Outcome::DestFull
                    }
                    SendOutcome::Failed => {
                        self.fault(&mut recipient, RouterError::DriverError);
                        Outcome::Aborted
                    }
                }
            }
            EntityType::Group => Outcome::Aborted,
        }
    }

    fn set_subscription(&self, entity: &mut Entity, subscription: Subscription) {
        if entity.subscription() == subscription {
            return;
        }
        entity.set_subscription(subscription);
        if entity.entity_type() != EntityType::Queue {
            return;
        }
        let paused = subscription == Subscription::Paused;
        if let Err(err) =
            self.drivers
                .queues
                .set_paused(entity.key().endpoint, SubscribeKind::Enqueue, paused)
        {
            debug!(entity = %entity.key(), %err, paused, "subscription not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bind_relation::BindRelation;
    use crate::dynamic::QueueDecisionService;
    use crate::sim::SimDrivers;
    use dgw_entity::{ChannelDesc, EntityInfo, RoutePolicy};
    use dgw_wire::layout::DynamicSchedConfig;

    struct Harness {
        sim: SimDrivers,
        drivers: Drivers,
        registry: Arc<EntityRegistry>,
        relation: BindRelation,
        data_objs: DataObjManager,
        dynamic: DynamicClient,
        stats: RouterStats,
    }

    impl Harness {
        fn new() -> Self {
            let sim = SimDrivers::new(1);
            for id in 0..64 {
                sim.queues.create_queue(EndpointId::queue(0, id), 8);
            }
            let drivers = sim.drivers();
            let registry = Arc::new(EntityRegistry::new(1));
            let relation = BindRelation::new(Arc::clone(&registry), drivers.clone());
            let data_objs = DataObjManager::new(drivers.pool.clone());
            let service = QueueDecisionService::new(drivers.queues.clone(), drivers.pool.clone());
            let dynamic = DynamicClient::new(Arc::new(service));
            Self {
                sim,
                drivers,
                registry,
                relation,
                data_objs,
                dynamic,
                stats: RouterStats::default(),
            }
        }

        fn send(&self, graph: &RelationGraph, info: &EntityInfo, msg: FsmMessage) -> RouterResult<()> {
            let fsm = Fsm {
                registry: &self.registry,
                graph,
                drivers: &self.drivers,
                data_objs: &self.data_objs,
                dynamic: &self.dynamic,
                stats: &self.stats,
            };
            let slot = self.registry.get(&info.key(Direction::Send)).unwrap();
            let mut entity = slot.lock();
            fsm.process_message(&mut entity, msg)
        }

        fn push(&self, info: &EntityInfo) -> RouterResult<()> {
            let graph = self.relation.committed();
            self.send(&graph, info, FsmMessage::Push)
        }

        fn state(&self, info: &EntityInfo, direction: Direction) -> FsmState {
            self.registry.get(&info.key(direction)).unwrap().lock().cur_state()
        }
    }

    fn q(id: u32) -> EntityInfo {
        EntityInfo::queue(0, id)
    }

    #[test]
    fn test_push_moves_one_message() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        h.sim.produce(q(1).endpoint, 11, b"a").unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
        let delivered = h.sim.consume(q(2).endpoint);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].trans_id, 11);
        assert_eq!(h.data_objs.tracker().live(), 0);
        assert_eq!(h.sim.pool.live(), 0);
        let slot = h.registry.get(&q(1).key(Direction::Send)).unwrap();
        assert_eq!(slot.lock().schedule_count(), 1);
    }

    #[test]
    fn test_push_on_empty_source_stays_idle() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
    }

    #[test]
    fn test_full_then_relief_redelivers() {
        let h = Harness::new();
        h.sim.queues.create_queue(q(2).endpoint, 2);
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        for tid in 1..=3 {
            h.sim.produce(q(1).endpoint, tid, b"x").unwrap();
        }
        h.push(&q(1)).unwrap();
        h.push(&q(1)).unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Full);
        assert_eq!(h.state(&q(2), Direction::Recv), FsmState::Full);
        assert!(h.sim.queues.is_paused(q(1).endpoint, SubscribeKind::Enqueue));

        // PUSH to a FULL source is queued, not rejected.
        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Full);

        assert_eq!(h.sim.consume(q(2).endpoint).len(), 2);
        let graph = h.relation.committed();
        let fsm = Fsm {
            registry: &h.registry,
            graph: &graph,
            drivers: &h.drivers,
            data_objs: &h.data_objs,
            dynamic: &h.dynamic,
            stats: &h.stats,
        };
        let dst = h.registry.get(&q(2).key(Direction::Recv)).unwrap();
        fsm.process_message(&mut dst.lock(), FsmMessage::F2nf).unwrap();
        assert_eq!(h.state(&q(2), Direction::Recv), FsmState::WaitPush);
        h.send(&graph, &q(1), FsmMessage::F2nf).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Peek);
        assert!(!h.sim.queues.is_paused(q(1).endpoint, SubscribeKind::Enqueue));

        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
        let delivered = h.sim.consume(q(2).endpoint);
        assert_eq!(delivered.iter().map(|m| m.trans_id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(h.sim.pool.live(), 0);
    }

    #[test]
    fn test_undefined_transition_fails_without_change() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        let graph = h.relation.committed();
        assert_eq!(h.send(&graph, &q(1), FsmMessage::F2nf), Err(RouterError::Failed));
        assert_eq!(h.send(&graph, &q(1), FsmMessage::Recover), Err(RouterError::Failed));
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
    }

    #[test]
    fn test_recipient_fault_aborts_only_that_recipient() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.bind(&q(1), &q(3)).unwrap();
        h.relation.order().unwrap();
        h.sim.queues.set_fail_enqueue(q(2).endpoint, Some(DriverError::Other(-1)));
        h.sim.produce(q(1).endpoint, 5, b"x").unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.state(&q(2), Direction::Recv), FsmState::Error);
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
        assert_eq!(h.sim.consume(q(3).endpoint).len(), 1);
        assert_eq!(h.data_objs.tracker().live(), 0);
        assert_eq!(h.sim.pool.live(), 0);
        assert_eq!(h.sim.pool.double_frees(), 0);
    }

    #[test]
    fn test_source_status_failure_is_error_then_recover() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        h.sim.produce(q(1).endpoint, 5, b"x").unwrap();
        h.sim.queues.set_fail_status(q(1).endpoint, true);
        assert_eq!(h.push(&q(1)), Err(RouterError::DriverError));
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Error);
        assert_eq!(h.push(&q(1)), Err(RouterError::Failed));

        h.sim.queues.set_fail_status(q(1).endpoint, false);
        let graph = h.relation.committed();
        h.send(&graph, &q(1), FsmMessage::Recover).unwrap();
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Idle);
        // The message held across the fault is delivered after recovery.
        h.push(&q(1)).unwrap();
        assert_eq!(h.sim.consume(q(2).endpoint).len(), 1);
    }

    #[test]
    fn test_hash_group_routes_by_trans_id() {
        let h = Harness::new();
        let members: Vec<EntityInfo> = (10..14).map(q).collect();
        let id = h.relation.create_group(&members, RoutePolicy::Hash).unwrap();
        h.relation.bind(&q(1), &EntityInfo::group(0, id, RoutePolicy::Hash)).unwrap();
        h.relation.order().unwrap();
        h.sim.produce(q(1).endpoint, 5, b"x").unwrap();
        h.sim.produce(q(1).endpoint, 0, b"x").unwrap();
        h.push(&q(1)).unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.sim.consume(q(11).endpoint).len(), 1);
        assert!(h.sim.consume(q(10).endpoint).is_empty());
        assert_eq!(h.stats.snapshot().unroutable, 1);
        assert_eq!(h.sim.pool.live(), 0);
    }

    #[test]
    fn test_broadcast_group_reaches_every_member() {
        let h = Harness::new();
        let members: Vec<EntityInfo> = (10..13).map(q).collect();
        let id = h.relation.create_group(&members, RoutePolicy::Broadcast).unwrap();
        h.relation
            .bind(&q(1), &EntityInfo::group(0, id, RoutePolicy::Broadcast))
            .unwrap();
        h.relation.order().unwrap();
        h.sim.produce(q(1).endpoint, 3, b"x").unwrap();
        h.push(&q(1)).unwrap();
        for m in 10..13 {
            assert_eq!(h.sim.consume(q(m).endpoint).len(), 1);
        }
        assert_eq!(h.sim.pool.live(), 0);
    }

    #[test]
    fn test_group_flag_follows_group_routes() {
        let h = Harness::new();
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        assert!(!h.registry.has_groups());
        h.sim.produce(q(1).endpoint, 1, b"x").unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.sim.consume(q(2).endpoint).len(), 1);

        let id = h.relation.create_group(&[q(10), q(11)], RoutePolicy::Broadcast).unwrap();
        let group = EntityInfo::group(0, id, RoutePolicy::Broadcast);
        h.relation.bind(&q(3), &group).unwrap();
        h.relation.order().unwrap();
        assert!(h.registry.has_groups());
        h.sim.produce(q(3).endpoint, 2, b"x").unwrap();
        h.push(&q(3)).unwrap();
        assert_eq!(h.sim.consume(q(10).endpoint).len(), 1);
        assert_eq!(h.sim.consume(q(11).endpoint).len(), 1);

        // The group stays resolvable until its removal is committed.
        h.relation.unbind(&q(3), &group).unwrap();
        assert!(h.registry.has_groups());
        h.relation.order().unwrap();
        assert!(!h.registry.has_groups());
        assert_eq!(h.sim.pool.live(), 0);
    }

    #[test]
    fn test_dynamic_group_parks_until_decision() {
        let h = Harness::new();
        h.dynamic
            .init(DynamicSchedConfig {
                sched_key: 1,
                request_queue_id: 50,
                request_resource: 0,
                response_queue_id: 51,
                response_resource: 0,
            })
            .unwrap();
        let src = q(1).with_sched_key(1).with_global_id(100);
        let members: Vec<EntityInfo> = (10..12).map(q).collect();
        let id = h.relation.create_group(&members, RoutePolicy::Dynamic).unwrap();
        h.relation
            .bind(&src, &EntityInfo::group(0, id, RoutePolicy::Dynamic))
            .unwrap();
        h.relation.order().unwrap();
        h.sim.produce(src.endpoint, 8, b"x").unwrap();
        h.push(&src).unwrap();
        assert_eq!(h.state(&src, Direction::Send), FsmState::TryPush);
        // Parked: another PUSH does nothing.
        h.push(&src).unwrap();
        assert_eq!(h.sim.consume(q(50).endpoint).len(), 1);

        let graph = h.relation.committed();
        let fsm = Fsm {
            registry: &h.registry,
            graph: &graph,
            drivers: &h.drivers,
            data_objs: &h.data_objs,
            dynamic: &h.dynamic,
            stats: &h.stats,
        };
        let response = DecisionResponse {
            sched_key: 1,
            src_global_id: 100,
            group_id: id,
            member_index: 1,
        };
        let out_of_range = DecisionResponse {
            member_index: 9,
            ..response.clone()
        };
        assert_eq!(fsm.apply_decision(&out_of_range), None);
        assert_eq!(fsm.apply_decision(&response), Some(src.key(Direction::Send)));
        assert_eq!(fsm.apply_decision(&response), None);
        h.push(&src).unwrap();
        assert_eq!(h.state(&src, Direction::Send), FsmState::Idle);
        assert_eq!(h.sim.consume(q(11).endpoint).len(), 1);
        assert_eq!(h.sim.pool.live(), 0);
    }

    #[test]
    fn test_restart_rerequests_parked_decision() {
        let h = Harness::new();
        h.dynamic
            .init(DynamicSchedConfig {
                sched_key: 1,
                request_queue_id: 50,
                request_resource: 0,
                response_queue_id: 51,
                response_resource: 0,
            })
            .unwrap();
        let src = q(1).with_sched_key(1).with_global_id(100);
        let id = h.relation.create_group(&[q(10)], RoutePolicy::Dynamic).unwrap();
        h.relation
            .bind(&src, &EntityInfo::group(0, id, RoutePolicy::Dynamic))
            .unwrap();
        h.relation.order().unwrap();
        h.sim.produce(src.endpoint, 8, b"x").unwrap();
        h.push(&src).unwrap();
        h.dynamic.restart(&[1]);
        h.push(&src).unwrap();
        assert_eq!(h.sim.consume(q(50).endpoint).len(), 2);
        assert_eq!(h.stats.snapshot().decisions_requested, 2);
    }

    #[test]
    fn test_unbind_in_flight_releases_once() {
        let h = Harness::new();
        h.sim.queues.create_queue(q(2).endpoint, 2);
        h.relation.bind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        for tid in 1..=3 {
            h.sim.produce(q(1).endpoint, tid, b"x").unwrap();
        }
        for _ in 0..3 {
            h.push(&q(1)).unwrap();
        }
        assert_eq!(h.state(&q(1), Direction::Send), FsmState::Full);
        assert_eq!(h.data_objs.tracker().live(), 1);
        h.relation.unbind(&q(1), &q(2)).unwrap();
        h.relation.order().unwrap();
        assert_eq!(h.data_objs.tracker().live(), 0);
        assert_eq!(h.data_objs.tracker().released(), 3);
        h.sim.consume(q(2).endpoint);
        assert_eq!(h.sim.pool.live(), 0);
        assert_eq!(h.sim.pool.double_frees(), 0);
    }

    #[test]
    fn test_channel_recipient_send() {
        let h = Harness::new();
        let desc = ChannelDesc {
            comm_handle: 1,
            local_tag_id: 4,
            peer_tag_id: 4,
            local_rank_id: 0,
            peer_rank_id: 1,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        };
        let chan = EntityInfo::channel(0, 9, desc);
        h.relation.bind(&q(1), &chan).unwrap();
        h.relation.order().unwrap();
        h.sim.produce(q(1).endpoint, 21, b"payload").unwrap();
        h.push(&q(1)).unwrap();
        assert_eq!(h.sim.transport.delivered(&desc), vec![(21, b"payload".to_vec())]);
        assert_eq!(h.data_objs.tracker().live(), 0);
    }
}
