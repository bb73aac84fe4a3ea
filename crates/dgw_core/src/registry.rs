//! Entity registry: every live entity, sharded by resource index.
//!
//! Entities are created lazily on first lookup and reference counted by the
//! relations that use them. The registry only ever touches reference counts
//! under its map locks; entity locks are taken by callers after a handle has
//! been cloned out, so map and entity locks never nest.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dgw_entity::{Direction, EntityInfo, EntityKey, EntityType, RouterError, RouterResult};
use tracing::{debug, info};

use crate::entity::{Entity, EntityHandle, EntitySlot};

/// `(schedule key, global id, direction)`.
type GlobalIdKey = (u32, u32, Direction);

#[derive(Debug)]
pub struct EntityRegistry {
    shards: Vec<DashMap<EntityKey, EntityHandle>>,
    by_global_id: DashMap<GlobalIdKey, EntityKey>,
    /// Per-shard hint that some entity may be FULL.
    full_hint: Vec<AtomicBool>,
    group_count: AtomicUsize,
    channel_count: AtomicUsize,
}

impl EntityRegistry {
    /// Create a registry with one shard per resource index.
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count).map(|_| DashMap::new()).collect(),
            by_global_id: DashMap::new(),
            full_hint: (0..shard_count).map(|_| AtomicBool::new(false)).collect(),
            group_count: AtomicUsize::new(0),
            channel_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, resource_index: u32) -> RouterResult<&DashMap<EntityKey, EntityHandle>> {
        self.shards
            .get(resource_index as usize)
            .ok_or(RouterError::ParamInvalid)
    }

    /// Returns the entity for `info` in `direction`, creating it if needed.
    /// An existing entity gains one reference.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an out-of-range resource
    /// index.
    pub fn get_or_create(&self, info: &EntityInfo, direction: Direction) -> RouterResult<EntityHandle> {
        let shard = self.shard(info.endpoint.resource_index)?;
        let key = info.key(direction);
        let handle = match shard.entry(key) {
            Entry::Occupied(slot) => {
                let refs = slot.get().acquire();
                debug!(entity = %key, refs, "entity referenced");
                Arc::clone(slot.get())
            }
            Entry::Vacant(slot) => {
                let handle = Arc::new(EntitySlot::new(Entity::new(info.clone(), direction)));
                slot.insert(Arc::clone(&handle));
                self.on_created(info, key);
                handle
            }
        };
        Ok(handle)
    }

    fn on_created(&self, info: &EntityInfo, key: EntityKey) {
        match info.endpoint.entity_type {
            EntityType::Group => {
                self.group_count.fetch_add(1, Ordering::AcqRel);
            }
            EntityType::Channel => {
                self.channel_count.fetch_add(1, Ordering::AcqRel);
            }
            EntityType::Queue => {}
        }
        if let (Some(sched_key), Some(global_id)) = (info.sched_key, info.global_id) {
            self.by_global_id
                .insert((sched_key, global_id, key.direction), key);
        }
        info!(entity = %key, "entity created");
    }

    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.shard(key.resource_index())
            .ok()?
            .get(key)
            .map(|slot| Arc::clone(slot.value()))
    }

    /// Drops one reference. The entity is removed when none remain and its
    /// handle returned so the caller can abort what it still holds.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an unknown entity.
    pub fn release(&self, key: &EntityKey) -> RouterResult<Option<EntityHandle>> {
        let shard = self.shard(key.resource_index())?;
        let slot = shard.get(key).map(|s| Arc::clone(s.value()));
        let slot = slot.ok_or(RouterError::ParamInvalid)?;
        if slot.release() > 0 {
            return Ok(None);
        }
        let removed = shard
            .remove_if(key, |_, s| s.refs() == 0)
            .map(|(_, s)| s);
        if let Some(handle) = &removed {
            self.on_removed(handle);
        }
        Ok(removed)
    }

    fn on_removed(&self, handle: &EntitySlot) {
        let key = handle.key();
        match key.endpoint.entity_type {
            EntityType::Group => {
                self.group_count.fetch_sub(1, Ordering::AcqRel);
            }
            EntityType::Channel => {
                self.channel_count.fetch_sub(1, Ordering::AcqRel);
            }
            EntityType::Queue => {}
        }
        self.by_global_id.retain(|_, k| *k != key);
        info!(entity = %key, "entity removed");
    }

    /// Resolves a decision-service identity to a registry key.
    #[must_use]
    pub fn by_global_id(&self, sched_key: u32, global_id: u32, direction: Direction) -> Option<EntityKey> {
        self.by_global_id
            .get(&(sched_key, global_id, direction))
            .map(|k| *k.value())
    }

    /// Handles of every entity in one shard, in key order.
    #[must_use]
    pub fn entities(&self, shard: usize) -> Vec<EntityHandle> {
        let Some(map) = self.shards.get(shard) else {
            return Vec::new();
        };
        let mut handles: Vec<EntityHandle> = map.iter().map(|e| Arc::clone(e.value())).collect();
        handles.sort_by_key(|h| h.key());
        handles
    }

    /// Channel entities of one shard in `direction`: sources receive from
    /// the transport, destinations send onto it.
    #[must_use]
    pub fn channels(&self, shard: usize, direction: Direction) -> Vec<EntityHandle> {
        if self.channel_count.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        self.entities(shard)
            .into_iter()
            .filter(|h| {
                let key = h.key();
                key.endpoint.entity_type == EntityType::Channel && key.direction == direction
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(DashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has_groups(&self) -> bool {
        self.group_count.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.channel_count.load(Ordering::Acquire) > 0
    }

    pub fn mark_full(&self, shard: usize) {
        if let Some(hint) = self.full_hint.get(shard) {
            hint.store(true, Ordering::Release);
        }
    }

    /// Clears and returns the FULL hint of `shard`.
    pub fn take_full_hint(&self, shard: usize) -> bool {
        self.full_hint
            .get(shard)
            .is_some_and(|hint| hint.swap(false, Ordering::AcqRel))
    }
}
