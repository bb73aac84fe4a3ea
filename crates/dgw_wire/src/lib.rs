//! # dgw_wire
//!
//! Byte-level contracts of the data-plane router.
//!
//! This crate provides:
//!
//! - [`sub_events`]: sub-event, command and query-mode codes.
//! - [`layout`]: fixed-size little-endian records of the config protocol.
//! - [`frame`]: server-side parsing of a config buffer and result write-back.
//! - [`client`]: request builders and result readers for callers.
//! - [`messages`]: decision-service request/response messages.
//! - [`codec`]: MessagePack serialisation helpers for those messages.
//! - [`error`]: wire-layer error types.

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod layout;
pub mod messages;
pub mod sub_events;

pub use codec::{decode, encode};
pub use error::WireError;
pub use frame::{ConfigFrame, ConfigRequest, RoutePair, RouteQuery};
pub use messages::{DecisionRequest, DecisionResponse};
pub use sub_events::{ConfigCmd, QueryMode, SubEvent};
