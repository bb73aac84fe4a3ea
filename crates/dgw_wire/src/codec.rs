//! MessagePack codec helpers.
//!
//! Thin wrappers around `rmp-serde` for the decision-service messages that
//! travel inside mbufs on the request and response queues.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Encode a value to MessagePack bytes.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if serialisation fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    rmp_serde::to_vec(value).map_err(WireError::Encode)
}

/// Decode a value from MessagePack bytes.
///
/// # Errors
///
/// Returns [`WireError::Decode`] if deserialisation fails.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WireError> {
    rmp_serde::from_slice(bytes).map_err(WireError::Decode)
}
