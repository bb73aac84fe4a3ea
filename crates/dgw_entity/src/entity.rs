//! Endpoint identity.
//!
//! An endpoint is a hardware queue, a tagged channel, or a group of either,
//! living on one resource index (device or locality domain). The bind graph
//! names endpoints by [`EndpointId`]; the registry additionally splits every
//! endpoint by [`Direction`], since the same queue may feed the router as a
//! route source and be fed by it as a destination.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelDesc;

/// Kind of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Queue,
    Channel,
    Group,
}

impl EntityType {
    /// Wire code of this type.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Queue => 0,
            Self::Channel => 1,
            Self::Group => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Queue),
            1 => Some(Self::Channel),
            2 => Some(Self::Group),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Channel => "channel",
            Self::Group => "group",
        }
    }
}

/// Which way data crosses the router at this entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// The entity feeds the router: a route source.
    Send,
    /// The router feeds the entity: a route destination or group member.
    Recv,
}

/// How a group picks the members that receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RoutePolicy {
    /// `members[transaction_id mod n]`.
    #[default]
    Hash,
    /// Every member.
    Broadcast,
    /// Decided by an external decision service.
    Dynamic,
}

impl RoutePolicy {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Hash => 0,
            Self::Broadcast => 1,
            Self::Dynamic => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Hash),
            1 => Some(Self::Broadcast),
            2 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// A node of the bind graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    pub resource_index: u32,
    pub entity_type: EntityType,
    pub id: u32,
}

impl EndpointId {
    #[must_use]
    pub const fn new(resource_index: u32, entity_type: EntityType, id: u32) -> Self {
        Self {
            resource_index,
            entity_type,
            id,
        }
    }

    #[must_use]
    pub const fn queue(resource_index: u32, id: u32) -> Self {
        Self::new(resource_index, EntityType::Queue, id)
    }

    #[must_use]
    pub const fn channel(resource_index: u32, id: u32) -> Self {
        Self::new(resource_index, EntityType::Channel, id)
    }

    #[must_use]
    pub const fn group(resource_index: u32, id: u32) -> Self {
        Self::new(resource_index, EntityType::Group, id)
    }

    /// The registry key of this endpoint in the given role.
    #[must_use]
    pub const fn with_direction(self, direction: Direction) -> EntityKey {
        EntityKey {
            endpoint: self,
            direction,
        }
    }

    #[must_use]
    pub const fn is_group(self) -> bool {
        matches!(self.entity_type, EntityType::Group)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.entity_type.as_str(),
            self.id,
            self.resource_index
        )
    }
}

/// Registry identity: `(resource index, type, id, direction)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub endpoint: EndpointId,
    pub direction: Direction,
}

impl EntityKey {
    #[must_use]
    pub const fn resource_index(&self) -> u32 {
        self.endpoint.resource_index
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dir = match self.direction {
            Direction::Send => "send",
            Direction::Recv => "recv",
        };
        write!(f, "{}/{dir}", self.endpoint)
    }
}

/// Full description of an endpoint as carried by bind and group requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub endpoint: EndpointId,
    /// Member selection policy; only meaningful for groups.
    pub policy: RoutePolicy,
    /// Present for channel endpoints.
    pub channel: Option<ChannelDesc>,
    /// Dynamic-schedule configuration this endpoint belongs to.
    pub sched_key: Option<u32>,
    /// Identifier understood by the decision service.
    pub global_id: Option<u32>,
}

impl EntityInfo {
    #[must_use]
    pub fn queue(resource_index: u32, id: u32) -> Self {
        Self::bare(EndpointId::queue(resource_index, id))
    }

    #[must_use]
    pub fn channel(resource_index: u32, id: u32, desc: ChannelDesc) -> Self {
        Self {
            channel: Some(desc),
            ..Self::bare(EndpointId::channel(resource_index, id))
        }
    }

    #[must_use]
    pub fn group(resource_index: u32, id: u32, policy: RoutePolicy) -> Self {
        Self {
            policy,
            ..Self::bare(EndpointId::group(resource_index, id))
        }
    }

    fn bare(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            policy: RoutePolicy::default(),
            channel: None,
            sched_key: None,
            global_id: None,
        }
    }

    /// Attach a decision-service identifier.
    #[must_use]
    pub fn with_global_id(mut self, global_id: u32) -> Self {
        self.global_id = Some(global_id);
        self
    }

    /// Attach a dynamic-schedule configuration key.
    #[must_use]
    pub fn with_sched_key(mut self, sched_key: u32) -> Self {
        self.sched_key = Some(sched_key);
        self
    }

    #[must_use]
    pub fn key(&self, direction: Direction) -> EntityKey {
        self.endpoint.with_direction(direction)
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.endpoint.is_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(EndpointId::queue(1, 42).to_string(), "queue:42@1");
        let key = EndpointId::channel(0, 3).with_direction(Direction::Recv);
        assert_eq!(key.to_string(), "channel:3@0/recv");
    }

    #[test]
    fn test_directions_are_distinct_keys() {
        let info = EntityInfo::queue(0, 5);
        assert_ne!(info.key(Direction::Send), info.key(Direction::Recv));
        assert_eq!(info.key(Direction::Send).endpoint, info.endpoint);
    }

    #[test]
    fn test_group_constructor_keeps_policy() {
        let info = EntityInfo::group(0, 9, RoutePolicy::Broadcast);
        assert!(info.is_group());
        assert_eq!(info.policy, RoutePolicy::Broadcast);
        assert!(info.channel.is_none());
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(EntityType::from_code(3), None);
        assert_eq!(RoutePolicy::from_code(7), None);
        assert_eq!(EntityType::from_code(1), Some(EntityType::Channel));
    }

    #[test]
    fn test_entity_info_serialization_roundtrip() {
        let info = EntityInfo::queue(2, 11).with_global_id(4).with_sched_key(1);
        let bytes = rmp_serde::to_vec(&info).unwrap();
        let restored: EntityInfo = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(info, restored);
    }
}
