//! Group member selection.

use dgw_entity::{EndpointId, RouterError, RouterResult, RoutePolicy};

use crate::bind_relation::Group;

/// Members chosen for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Members(Vec<EndpointId>),
    /// The decision service picks; the message waits for its answer.
    Deferred,
}

/// Picks the members of `group` that receive the message `trans_id`.
/// Quarantined members are not eligible.
///
/// # Errors
///
/// Returns [`RouterError::Failed`] for a hashed message without a
/// transaction id, or when no member is eligible.
pub fn search(group: &Group, trans_id: u64) -> RouterResult<Selection> {
    let healthy = group.healthy();
    match group.policy {
        RoutePolicy::Hash => {
            if trans_id == 0 || healthy.is_empty() {
                return Err(RouterError::Failed);
            }
            let index = usize::try_from(trans_id % healthy.len() as u64)
                .map_err(|_| RouterError::InnerError)?;
            Ok(Selection::Members(vec![healthy[index].endpoint]))
        }
        RoutePolicy::Broadcast => {
            if healthy.is_empty() {
                return Err(RouterError::Failed);
            }
            Ok(Selection::Members(healthy.iter().map(|m| m.endpoint).collect()))
        }
        RoutePolicy::Dynamic => Ok(Selection::Deferred),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgw_entity::EntityInfo;
    use std::collections::BTreeSet;

    fn group(policy: RoutePolicy, n: u32) -> Group {
        Group {
            id: 1,
            endpoint: EndpointId::group(0, 1),
            policy,
            members: (0..n).map(|i| EntityInfo::queue(0, 10 + i)).collect(),
            quarantined: BTreeSet::new(),
        }
    }

    fn picked(selection: Selection) -> Vec<EndpointId> {
        match selection {
            Selection::Members(members) => members,
            Selection::Deferred => panic!("unexpected deferral"),
        }
    }

    #[test]
    fn test_hash_picks_tid_mod_n() {
        let g = group(RoutePolicy::Hash, 4);
        assert_eq!(picked(search(&g, 5).unwrap()), vec![EndpointId::queue(0, 11)]);
        // Deterministic for a fixed membership.
        assert_eq!(search(&g, 5).unwrap(), search(&g, 5).unwrap());
    }

    #[test]
    fn test_hash_rejects_zero_tid() {
        let g = group(RoutePolicy::Hash, 4);
        assert_eq!(search(&g, 0), Err(RouterError::Failed));
    }

    #[test]
    fn test_hash_follows_membership() {
        let mut g = group(RoutePolicy::Hash, 4);
        g.quarantined.insert(EndpointId::queue(0, 10));
        // Three eligible members left: 5 mod 3 = 2.
        assert_eq!(picked(search(&g, 5).unwrap()), vec![EndpointId::queue(0, 13)]);
    }

    #[test]
    fn test_broadcast_returns_membership() {
        let g = group(RoutePolicy::Broadcast, 3);
        let expected: Vec<EndpointId> = g.members.iter().map(|m| m.endpoint).collect();
        assert_eq!(picked(search(&g, 0).unwrap()), expected);
    }

    #[test]
    fn test_empty_group_fails() {
        let mut g = group(RoutePolicy::Broadcast, 1);
        g.quarantined.insert(EndpointId::queue(0, 10));
        assert_eq!(search(&g, 3), Err(RouterError::Failed));
    }

    #[test]
    fn test_dynamic_defers() {
        let g = group(RoutePolicy::Dynamic, 2);
        assert_eq!(search(&g, 0), Ok(Selection::Deferred));
    }
}
