//! Wire-layer error types.

use dgw_entity::RouterError;

/// Errors that can occur while encoding or decoding router payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Failed to encode a message to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a message from MessagePack.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The buffer length does not match the counts it declares.
    #[error("buffer length {actual} does not match expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// The buffer ends before a fixed-size record.
    #[error("buffer of {actual} bytes truncated, need {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("unknown sub-event {0}")]
    UnknownSubEvent(u32),

    #[error("unknown config command {0}")]
    UnknownCommand(u32),

    #[error("unknown query mode {0}")]
    UnknownQueryMode(u32),

    /// A record field carries a value outside its domain.
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },

    /// A declared entry count is outside its allowed range.
    #[error("count {count} outside 1..={max}")]
    CountOutOfRange { count: usize, max: usize },
}

impl From<WireError> for RouterError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Encode(_) => Self::InnerError,
            _ => Self::ParamInvalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_buffers_map_to_param_invalid() {
        let err = WireError::LengthMismatch {
            expected: 16,
            actual: 12,
        };
        assert_eq!(RouterError::from(err), RouterError::ParamInvalid);
        assert_eq!(
            RouterError::from(WireError::UnknownSubEvent(99)),
            RouterError::ParamInvalid
        );
    }
}
