//! Config protocol codes.
//!
//! A config request is a raw buffer tagged with a sub-event code. Update
//! requests further carry a [`ConfigCmd`] in their header, queries a
//! [`QueryMode`].

use crate::error::WireError;

// ── Sub-events ──────────────────────────────────────────────────────────────

/// Bind, unbind, group and dynamic-schedule updates.
pub const UPDATE_CONFIG: u32 = 1;

/// Number of routes or group members matching a query.
pub const QUERY_CONFIG_NUM: u32 = 2;

/// Routes or group members matching a query.
pub const QUERY_CONFIG: u32 = 3;

/// Register a collective-communication handle.
pub const CREATE_COMM_HANDLE: u32 = 4;

pub const DESTROY_COMM_HANDLE: u32 = 5;

/// Whether every channel has exchanged its link message.
pub const QUERY_LINK_STATUS: u32 = 6;

// ── Limits ──────────────────────────────────────────────────────────────────

/// Most routes a single bind or unbind request may carry.
pub const MAX_ROUTES_NUM: usize = 1024;

/// Most members a single add-group request may carry.
pub const MAX_GROUP_MEMBERS: usize = 1024;

/// Longest communication handle name.
pub const MAX_COMM_NAME_LEN: usize = 128;

/// A typed sub-event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubEvent {
    UpdateConfig,
    QueryConfigNum,
    QueryConfig,
    CreateCommHandle,
    DestroyCommHandle,
    QueryLinkStatus,
}

impl SubEvent {
    /// # Errors
    ///
    /// Returns [`WireError::UnknownSubEvent`] for codes outside the protocol.
    pub const fn from_code(code: u32) -> Result<Self, WireError> {
        match code {
            UPDATE_CONFIG => Ok(Self::UpdateConfig),
            QUERY_CONFIG_NUM => Ok(Self::QueryConfigNum),
            QUERY_CONFIG => Ok(Self::QueryConfig),
            CREATE_COMM_HANDLE => Ok(Self::CreateCommHandle),
            DESTROY_COMM_HANDLE => Ok(Self::DestroyCommHandle),
            QUERY_LINK_STATUS => Ok(Self::QueryLinkStatus),
            other => Err(WireError::UnknownSubEvent(other)),
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::UpdateConfig => UPDATE_CONFIG,
            Self::QueryConfigNum => QUERY_CONFIG_NUM,
            Self::QueryConfig => QUERY_CONFIG,
            Self::CreateCommHandle => CREATE_COMM_HANDLE,
            Self::DestroyCommHandle => DESTROY_COMM_HANDLE,
            Self::QueryLinkStatus => QUERY_LINK_STATUS,
        }
    }
}

/// Command carried in the header of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCmd {
    BindRoute,
    UnbindRoute,
    AddGroup,
    DelGroup,
    InitDynamicSchedule,
    StopSchedule,
    /// Drop cached decisions, then resume scheduling.
    RestartSchedule,
}

impl ConfigCmd {
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCommand`] for codes outside the protocol.
    pub const fn from_code(code: u32) -> Result<Self, WireError> {
        match code {
            0 => Ok(Self::BindRoute),
            1 => Ok(Self::UnbindRoute),
            2 => Ok(Self::AddGroup),
            3 => Ok(Self::DelGroup),
            4 => Ok(Self::InitDynamicSchedule),
            5 => Ok(Self::StopSchedule),
            6 => Ok(Self::RestartSchedule),
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::BindRoute => 0,
            Self::UnbindRoute => 1,
            Self::AddGroup => 2,
            Self::DelGroup => 3,
            Self::InitDynamicSchedule => 4,
            Self::StopSchedule => 5,
            Self::RestartSchedule => 6,
        }
    }
}

/// Selection mode of a route query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    BySrc,
    ByDst,
    BySrcDst,
    All,
    /// Members of one group.
    Group,
}

impl QueryMode {
    /// # Errors
    ///
    /// Returns [`WireError::UnknownQueryMode`] for codes outside the protocol.
    pub const fn from_code(code: u32) -> Result<Self, WireError> {
        match code {
            0 => Ok(Self::BySrc),
            1 => Ok(Self::ByDst),
            2 => Ok(Self::BySrcDst),
            3 => Ok(Self::All),
            4 => Ok(Self::Group),
            other => Err(WireError::UnknownQueryMode(other)),
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::BySrc => 0,
            Self::ByDst => 1,
            Self::BySrcDst => 2,
            Self::All => 3,
            Self::Group => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_event_codes_match_constants() {
        assert_eq!(SubEvent::from_code(1).unwrap(), SubEvent::UpdateConfig);
        assert_eq!(SubEvent::QueryLinkStatus.code(), QUERY_LINK_STATUS);
        assert!(matches!(
            SubEvent::from_code(0),
            Err(WireError::UnknownSubEvent(0))
        ));
    }

    #[test]
    fn test_unknown_command_and_mode() {
        assert!(matches!(
            ConfigCmd::from_code(7),
            Err(WireError::UnknownCommand(7))
        ));
        assert!(matches!(
            QueryMode::from_code(5),
            Err(WireError::UnknownQueryMode(5))
        ));
        assert_eq!(
            ConfigCmd::from_code(ConfigCmd::RestartSchedule.code()).unwrap(),
            ConfigCmd::RestartSchedule
        );
    }
}
