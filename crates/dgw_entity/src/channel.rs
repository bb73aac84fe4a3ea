//! Tagged channel attributes.
//!
//! A channel endpoint is one side of a tag on a collective-communication
//! handle. Its depths bound how many transfers may be in flight at once.

use serde::{Deserialize, Serialize};

use crate::status::{RouterError, RouterResult};

/// Largest tag depth a channel may declare.
pub const MAX_TAG_DEPTH: u32 = 8192;

/// Attributes of a tagged channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelDesc {
    /// Communication handle the tag lives on.
    pub comm_handle: u64,
    pub local_tag_id: u32,
    pub peer_tag_id: u32,
    pub local_rank_id: u32,
    pub peer_rank_id: u32,
    /// In-flight receives this side accepts.
    pub local_tag_depth: u32,
    /// In-flight sends the peer may have outstanding.
    pub peer_tag_depth: u32,
}

impl ChannelDesc {
    /// Validates the tag and rank pairing. Depths are only checked when
    /// `check_depth` is set, since route queries carry no depths.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] when the tags differ, the ranks
    /// are equal, or a depth is zero or above [`MAX_TAG_DEPTH`].
    pub fn validate(&self, check_depth: bool) -> RouterResult<()> {
        if self.local_tag_id != self.peer_tag_id || self.local_rank_id == self.peer_rank_id {
            return Err(RouterError::ParamInvalid);
        }
        if !check_depth {
            return Ok(());
        }
        let depth_ok = |depth: u32| depth != 0 && depth <= MAX_TAG_DEPTH;
        if !depth_ok(self.local_tag_depth) || !depth_ok(self.peer_tag_depth) {
            return Err(RouterError::ParamInvalid);
        }
        Ok(())
    }

    /// Maximum number of receives in flight at once.
    #[must_use]
    pub const fn concurrency_cap(&self) -> usize {
        self.local_tag_depth as usize
    }

    /// Depth of the uncompleted-request queue. Every transfer is two
    /// requests (data and header) plus one slot for a link message.
    #[must_use]
    pub const fn uncompleted_depth(&self) -> usize {
        self.local_tag_depth as usize * 2 + 1
    }

    /// Depth of the probed-envelope cache.
    #[must_use]
    pub const fn cache_depth(&self) -> usize {
        self.peer_tag_depth as usize * 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> ChannelDesc {
        ChannelDesc {
            comm_handle: 1,
            local_tag_id: 7,
            peer_tag_id: 7,
            local_rank_id: 0,
            peer_rank_id: 1,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        }
    }

    #[test]
    fn test_valid_channel() {
        assert!(desc().validate(true).is_ok());
        assert_eq!(desc().concurrency_cap(), 2);
        assert_eq!(desc().uncompleted_depth(), 5);
    }

    #[test]
    fn test_mismatched_tags_rejected() {
        let mut d = desc();
        d.peer_tag_id = 8;
        assert_eq!(d.validate(false), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_same_rank_rejected() {
        let mut d = desc();
        d.peer_rank_id = d.local_rank_id;
        assert_eq!(d.validate(true), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_depth_only_checked_when_asked() {
        let mut d = desc();
        d.local_tag_depth = 0;
        assert!(d.validate(false).is_ok());
        assert_eq!(d.validate(true), Err(RouterError::ParamInvalid));
        d.local_tag_depth = MAX_TAG_DEPTH + 1;
        assert_eq!(d.validate(true), Err(RouterError::ParamInvalid));
    }
}
