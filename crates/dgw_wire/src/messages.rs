//! Messages exchanged with the external decision service.
//!
//! A dynamic group defers member selection: the router publishes a
//! [`DecisionRequest`] on the schedule key's request queue and later polls a
//! [`DecisionResponse`] from its response queue.

use serde::{Deserialize, Serialize};

/// Asks the decision service which member of a group receives a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Dynamic-schedule configuration the route belongs to.
    pub sched_key: u32,
    /// Global id of the routing source.
    pub src_global_id: u32,
    /// Global id of the destination group.
    pub group_id: u32,
    /// Transaction id carried in the mbuf header.
    pub trans_id: u64,
    /// Resource index of the source, so a response can find its shard.
    pub resource_index: u32,
}

/// The decision service's answer to a [`DecisionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub sched_key: u32,
    pub src_global_id: u32,
    pub group_id: u32,
    /// Index into the group's member list.
    pub member_index: u32,
}

impl DecisionResponse {
    /// Builds the response selecting `member_index` for `request`.
    #[must_use]
    pub fn answer(request: &DecisionRequest, member_index: u32) -> Self {
        Self {
            sched_key: request.sched_key,
            src_global_id: request.src_global_id,
            group_id: request.group_id,
            member_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_echoes_request_identity() {
        let req = DecisionRequest {
            sched_key: 3,
            src_global_id: 17,
            group_id: 900,
            trans_id: 55,
            resource_index: 1,
        };
        let resp = DecisionResponse::answer(&req, 2);
        assert_eq!(resp.sched_key, 3);
        assert_eq!(resp.src_global_id, 17);
        assert_eq!(resp.group_id, 900);
        assert_eq!(resp.member_index, 2);
    }

    #[test]
    fn test_decision_request_roundtrip() {
        let req = DecisionRequest {
            sched_key: 1,
            src_global_id: 2,
            group_id: 3,
            trans_id: u64::MAX,
            resource_index: 0,
        };
        let bytes = crate::codec::encode(&req).unwrap();
        let restored: DecisionRequest = crate::codec::decode(&bytes).unwrap();
        assert_eq!(restored, req);
    }
}
