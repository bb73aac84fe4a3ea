//! Communication handles.
//!
//! Channel endpoints name the collective-communication handle their tag
//! lives on. Handles are created and destroyed over the config protocol and
//! must exist before a channel can be bound.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dgw_entity::{RouterError, RouterResult};
use dgw_wire::sub_events::MAX_COMM_NAME_LEN;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommHandle {
    pub handle: u64,
    pub rank_id: u32,
    pub name: String,
    /// Distinguishes incarnations of the same name across re-creation.
    pub session: Uuid,
}

#[derive(Debug)]
pub struct CommHandles {
    handles: DashMap<u64, CommHandle>,
    next_handle: AtomicU64,
}

impl Default for CommHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl CommHandles {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Creates a handle for `rank_id` on the communicator `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an empty or overlong name, or
    /// a name already open on the same rank.
    pub fn create(&self, rank_id: u32, name: &str) -> RouterResult<u64> {
        if name.is_empty() || name.len() > MAX_COMM_NAME_LEN {
            return Err(RouterError::ParamInvalid);
        }
        if self
            .handles
            .iter()
            .any(|h| h.rank_id == rank_id && h.name == name)
        {
            return Err(RouterError::ParamInvalid);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        let session = Uuid::new_v4();
        self.handles.insert(
            handle,
            CommHandle {
                handle,
                rank_id,
                name: name.to_owned(),
                session,
            },
        );
        info!(handle, rank_id, name, %session, "comm handle created");
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an unknown handle.
    pub fn destroy(&self, handle: u64) -> RouterResult<CommHandle> {
        let (_, removed) = self
            .handles
            .remove(&handle)
            .ok_or(RouterError::ParamInvalid)?;
        info!(handle, name = %removed.name, "comm handle destroyed");
        Ok(removed)
    }

    #[must_use]
    pub fn contains(&self, handle: u64) -> bool {
        self.handles.contains_key(&handle)
    }

    #[must_use]
    pub fn get(&self, handle: u64) -> Option<CommHandle> {
        self.handles.get(&handle).map(|h| h.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let handles = CommHandles::new();
        let a = handles.create(0, "world").unwrap();
        let b = handles.create(1, "world").unwrap();
        assert_ne!(a, b);
        assert!(handles.contains(a));
        assert_ne!(handles.get(a).unwrap().session, handles.get(b).unwrap().session);
        handles.destroy(a).unwrap();
        assert!(!handles.contains(a));
        assert_eq!(handles.destroy(a), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_name_rules() {
        let handles = CommHandles::new();
        assert_eq!(handles.create(0, ""), Err(RouterError::ParamInvalid));
        let long = "n".repeat(MAX_COMM_NAME_LEN + 1);
        assert_eq!(handles.create(0, &long), Err(RouterError::ParamInvalid));
        handles.create(0, "world").unwrap();
        assert_eq!(handles.create(0, "world"), Err(RouterError::ParamInvalid));
    }
}
