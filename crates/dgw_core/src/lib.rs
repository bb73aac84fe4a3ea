//! # dgw_core
//!
//! The data plane of the router: it moves buffers from bound sources to
//! their destinations across hardware queues and tagged channels.
//!
//! This crate provides:
//!
//! - [`registry`]: every live entity, sharded by resource index.
//! - [`bind_relation`]: the staged and committed route graph.
//! - [`fsm`]: the per-entity state machine that moves one message per `PUSH`.
//! - [`strategy`]: hash, broadcast and dynamic member selection.
//! - [`channel`]: tagged-channel receive and send bookkeeping.
//! - [`dynamic`]: the external decision-service client.
//! - [`scheduler`]: per-shard worker threads and the scheduling pass.
//! - [`config_server`]: the config protocol applied to a [`RouterContext`].
//! - [`driver`] and [`sim`]: the external primitives and their in-memory
//!   implementation.

pub mod bind_relation;
pub mod channel;
pub mod comm;
pub mod config;
pub mod config_server;
pub mod context;
pub mod data_obj;
pub mod driver;
pub mod dynamic;
pub mod entity;
pub mod fsm;
pub mod mbuf;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod strategy;

pub use bind_relation::{BindRelation, Group, RelationGraph};
pub use config::{ConfigError, RouterConfig};
pub use config_server::ConfigServer;
pub use context::RouterContext;
pub use driver::{Drivers, Event, EventKind};
pub use fsm::{FsmMessage, FsmState};
pub use scheduler::Scheduler;
pub use sim::SimDrivers;
pub use stats::{RouterStats, StatsSnapshot};
