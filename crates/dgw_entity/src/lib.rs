//! # dgw_entity
//!
//! The vocabulary shared by every router crate: who an endpoint is, how a
//! group picks its members, and how failures are reported.
//!
//! This crate provides:
//!
//! - [`EndpointId`]: graph node identity `(resource index, type, id)`.
//! - [`EntityKey`]: registry identity, an endpoint plus its [`Direction`].
//! - [`EntityInfo`]: full endpoint description (policy, channel, schedule key).
//! - [`ChannelDesc`]: tagged channel attributes and their validation.
//! - [`RouterError`]: the status taxonomy and its wire codes.

pub mod channel;
pub mod entity;
pub mod status;

pub use channel::{ChannelDesc, MAX_TAG_DEPTH};
pub use entity::{Direction, EndpointId, EntityInfo, EntityKey, EntityType, RoutePolicy};
pub use status::{RouterError, RouterResult, STATUS_OK, status_code};
