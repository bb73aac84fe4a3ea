//! Router context.
//!
//! One [`RouterContext`] owns everything a router instance shares between
//! its scheduler workers and its config server: the registry, the bind
//! graph, the drivers and the dynamic-schedule client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dgw_entity::{EntityKey, RouterError, RouterResult};
use tracing::info;

use crate::bind_relation::{BindRelation, RelationGraph};
use crate::comm::CommHandles;
use crate::config::RouterConfig;
use crate::data_obj::DataObjManager;
use crate::driver::Drivers;
use crate::dynamic::{DecisionService, DynamicClient, QueueDecisionService};
use crate::fsm::{Fsm, FsmMessage};
use crate::registry::EntityRegistry;
use crate::stats::RouterStats;

/// Per-shard pass exclusion.
#[derive(Debug, Default)]
struct PassSlot {
    running: AtomicBool,
    /// Another worker asked for a pass while one was running.
    rerun: AtomicBool,
}

/// Held while a worker runs a pass over one shard.
pub struct PassGuard<'a> {
    slot: &'a PassSlot,
}

impl PassGuard<'_> {
    /// Clears and returns the rerun request.
    pub fn take_rerun(&self) -> bool {
        self.slot.rerun.swap(false, Ordering::AcqRel)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
    }
}

pub struct RouterContext {
    config: RouterConfig,
    registry: Arc<EntityRegistry>,
    relation: BindRelation,
    drivers: Drivers,
    data_objs: DataObjManager,
    dynamic: DynamicClient,
    comm_handles: CommHandles,
    stats: RouterStats,
    passes: Vec<PassSlot>,
}

impl std::fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterContext")
            .field("config", &self.config)
            .field("entities", &self.registry.len())
            .field("relation", &self.relation)
            .finish_non_exhaustive()
    }
}

impl RouterContext {
    /// Creates a context whose decision service speaks over the drivers'
    /// queues.
    #[must_use]
    pub fn new(config: RouterConfig, drivers: Drivers) -> Self {
        let service = QueueDecisionService::new(
            Arc::clone(&drivers.queues),
            Arc::clone(&drivers.pool),
        );
        Self::with_decision_service(config, drivers, Arc::new(service))
    }

    #[must_use]
    pub fn with_decision_service(
        config: RouterConfig,
        drivers: Drivers,
        service: Arc<dyn DecisionService>,
    ) -> Self {
        let registry = Arc::new(EntityRegistry::new(config.shard_count));
        let relation = BindRelation::new(Arc::clone(&registry), drivers.clone());
        let data_objs = DataObjManager::new(Arc::clone(&drivers.pool));
        info!(
            shards = config.shard_count,
            workers_per_shard = config.workers_per_shard,
            "router context created"
        );
        Self {
            passes: (0..config.shard_count).map(|_| PassSlot::default()).collect(),
            registry,
            relation,
            data_objs,
            dynamic: DynamicClient::new(service),
            comm_handles: CommHandles::new(),
            stats: RouterStats::default(),
            drivers,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    #[must_use]
    pub fn relation(&self) -> &BindRelation {
        &self.relation
    }

    #[must_use]
    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    #[must_use]
    pub fn data_objs(&self) -> &DataObjManager {
        &self.data_objs
    }

    #[must_use]
    pub fn dynamic(&self) -> &DynamicClient {
        &self.dynamic
    }

    #[must_use]
    pub fn comm_handles(&self) -> &CommHandles {
        &self.comm_handles
    }

    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// State machine bound to `graph`.
    #[must_use]
    pub fn fsm<'a>(&'a self, graph: &'a RelationGraph) -> Fsm<'a> {
        Fsm {
            registry: &self.registry,
            graph,
            drivers: &self.drivers,
            data_objs: &self.data_objs,
            dynamic: &self.dynamic,
            stats: &self.stats,
        }
    }

    /// Takes the pass slot of `shard`. When another worker holds it, the
    /// holder is asked to run once more and `None` is returned.
    pub fn try_begin_pass(&self, shard: usize) -> Option<PassGuard<'_>> {
        let slot = self.passes.get(shard)?;
        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(PassGuard { slot })
        } else {
            slot.rerun.store(true, Ordering::Release);
            None
        }
    }

    /// A pass was requested while the last one was finishing.
    #[must_use]
    pub fn rerun_requested(&self, shard: usize) -> bool {
        self.passes
            .get(shard)
            .is_some_and(|slot| slot.rerun.load(Ordering::Acquire))
    }

    /// Clears the fault of `key` and brings its quarantined relations back
    /// into the committed graph.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an unknown entity,
    /// [`RouterError::Failed`] if it is not faulted, or
    /// [`RouterError::Retry`] if the restored graph could not be committed
    /// yet.
    pub fn recover(&self, key: EntityKey) -> RouterResult<()> {
        let slot = self.registry.get(&key).ok_or(RouterError::ParamInvalid)?;
        let graph = self.relation.committed();
        self.fsm(&graph)
            .process_message(&mut slot.lock(), FsmMessage::Recover)?;
        let restored = self.relation.restore(key.endpoint);
        info!(entity = %key, restored, "entity recovered");
        self.relation.order()
    }
}
