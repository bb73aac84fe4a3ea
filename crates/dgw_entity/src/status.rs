//! Router status taxonomy.
//!
//! Every fallible router operation returns [`RouterResult`]. Statuses travel
//! over the configuration protocol as `i32` codes where `0` is success.

/// Wire code for success.
pub const STATUS_OK: i32 = 0;

/// Result alias used across the router crates.
pub type RouterResult<T> = Result<T, RouterError>;

/// Failure statuses shared by the graph, the state machine and the
/// configuration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum RouterError {
    /// Request rejected before any mutation.
    #[error("parameter invalid")]
    ParamInvalid,

    /// Invariant violation or allocation failure.
    #[error("inner error")]
    InnerError,

    /// A driver or transport call failed.
    #[error("driver error")]
    DriverError,

    /// Component used before it was initialised.
    #[error("not initialised")]
    NotInit,

    /// A bounded wait elapsed.
    #[error("timeout")]
    Timeout,

    /// A concurrent graph commit is in progress; the caller must re-issue.
    #[error("retry")]
    Retry,

    /// The endpoint combination cannot be routed.
    #[error("endpoint type not supported")]
    EndpointTypeNotSupported,

    #[error("group does not exist")]
    GroupNotExist,

    #[error("group is still referenced by a route")]
    GroupExistInRoute,

    /// Undefined state machine transition or an unsatisfiable selection.
    #[error("failed")]
    Failed,

    #[error("dynamic schedule error")]
    DynamicScheduleError,
}

impl RouterError {
    /// Returns the wire code of this status.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParamInvalid => 1,
            Self::InnerError => 2,
            Self::DriverError => 3,
            Self::NotInit => 4,
            Self::Timeout => 5,
            Self::Retry => 6,
            Self::EndpointTypeNotSupported => 7,
            Self::GroupNotExist => 8,
            Self::GroupExistInRoute => 9,
            Self::Failed => 10,
            Self::DynamicScheduleError => 11,
        }
    }

    /// Maps a wire code back to a status. `0` and unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::ParamInvalid),
            2 => Some(Self::InnerError),
            3 => Some(Self::DriverError),
            4 => Some(Self::NotInit),
            5 => Some(Self::Timeout),
            6 => Some(Self::Retry),
            7 => Some(Self::EndpointTypeNotSupported),
            8 => Some(Self::GroupNotExist),
            9 => Some(Self::GroupExistInRoute),
            10 => Some(Self::Failed),
            11 => Some(Self::DynamicScheduleError),
            _ => None,
        }
    }
}

/// Converts an operation outcome into its wire code.
#[must_use]
pub fn status_code(result: RouterResult<()>) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_ok_is_zero() {
        assert_eq!(status_code(Ok(())), STATUS_OK);
        assert_eq!(status_code(Err(RouterError::Retry)), 6);
    }

    #[test]
    fn test_from_code_rejects_unknown() {
        assert_eq!(RouterError::from_code(0), None);
        assert_eq!(RouterError::from_code(-1), None);
        assert_eq!(RouterError::from_code(99), None);
        assert_eq!(
            RouterError::from_code(RouterError::GroupExistInRoute.code()),
            Some(RouterError::GroupExistInRoute)
        );
    }
}
