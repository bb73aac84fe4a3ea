//! Boundaries to the platform: queues, events and the tagged transport.
//!
//! The router never touches hardware directly. Every external primitive is a
//! trait object so the scheduler can run against real drivers or the
//! in-memory [`sim`](crate::sim) implementations.

use std::sync::Arc;
use std::time::Duration;

use dgw_entity::{ChannelDesc, EndpointId, RouterError};

use crate::mbuf::{BufferPool, Mbuf};

/// Failures reported by a queue driver or buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The queue is at capacity.
    #[error("queue full")]
    Full,

    #[error("queue does not exist")]
    NotExist,

    #[error("out of buffer memory")]
    NoMemory,

    /// The handle does not name a live buffer.
    #[error("invalid buffer")]
    InvalidBuffer,

    #[error("driver error {0}")]
    Other(i32),
}

impl From<DriverError> for RouterError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NoMemory | DriverError::InvalidBuffer => Self::InnerError,
            DriverError::NotExist => Self::ParamInvalid,
            DriverError::Full | DriverError::Other(_) => Self::DriverError,
        }
    }
}

// ── Queues ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub depth: usize,
    pub capacity: usize,
}

impl QueueStatus {
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.depth >= self.capacity
    }
}

/// Queue events a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeKind {
    /// A buffer was enqueued.
    Enqueue,
    /// A full queue has room again.
    FullToNotFull,
}

/// Hardware queue driver. Queues are named by queue endpoints.
pub trait QueueDriver: Send + Sync {
    /// Enqueues a buffer. On failure the buffer is handed back so the
    /// caller can free it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Full`] when the queue is at capacity.
    fn enqueue(&self, queue: EndpointId, mbuf: Mbuf) -> Result<(), (DriverError, Mbuf)>;

    /// # Errors
    ///
    /// Returns [`DriverError`] if the queue cannot be read.
    fn dequeue(&self, queue: EndpointId) -> Result<Option<Mbuf>, DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError::NotExist`] for an unknown queue.
    fn status(&self, queue: EndpointId) -> Result<QueueStatus, DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError`] if the subscription cannot be installed.
    fn subscribe(&self, queue: EndpointId, kind: SubscribeKind) -> Result<(), DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError`] if the subscription cannot be removed.
    fn unsubscribe(&self, queue: EndpointId, kind: SubscribeKind) -> Result<(), DriverError>;

    /// Stops or resumes event delivery without dropping the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if the queue is not subscribed.
    fn set_paused(&self, queue: EndpointId, kind: SubscribeKind, paused: bool)
    -> Result<(), DriverError>;
}

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enqueue,
    FullToNotFull,
    /// Channels should probe for new envelopes.
    RecvRequest,
    RecvCompletion,
    SendCompletion,
    /// A shard should retry its FULL entities.
    CongestionRelief,
    /// Anything the router does not know how to handle.
    Unknown(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Queue the event concerns, if any.
    pub subject: Option<EndpointId>,
}

impl Event {
    #[must_use]
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            subject: None,
        }
    }

    #[must_use]
    pub const fn on(kind: EventKind, subject: EndpointId) -> Self {
        Self {
            kind,
            subject: Some(subject),
        }
    }
}

/// Per-shard event source. Waiting is the scheduler's only suspension point.
pub trait EventWaiter: Send + Sync {
    /// Blocks until an event for `shard` arrives or `timeout` elapses.
    /// `Ok(None)` is a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if the wait itself failed.
    fn wait(&self, shard: usize, timeout: Duration) -> Result<Option<Event>, DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError`] if the event cannot be queued.
    fn submit(&self, shard: usize, event: Event) -> Result<(), DriverError>;
}

// ── Tagged transport ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Which region of an mbuf a transfer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPart {
    Data,
    Header,
}

/// A probed, not yet received message. A zero-length envelope is a link
/// message and is consumed by the probe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub message: u64,
    /// Length of the data region.
    pub len: usize,
}

impl Envelope {
    #[must_use]
    pub const fn is_link(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub request: RequestId,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No resources right now; retry later.
    #[error("transport busy")]
    Again,

    #[error("transport failure {0}")]
    Failed(i32),
}

/// Collective-communication transport addressed by channel tags.
pub trait TagTransport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError`] if probing failed.
    fn probe(&self, channel: &ChannelDesc) -> Result<Option<Envelope>, TransportError>;

    /// Receives one part of a probed message into `mbuf`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the receive cannot be posted.
    fn irecv(
        &self,
        channel: &ChannelDesc,
        envelope: &Envelope,
        mbuf: &Mbuf,
        part: TransferPart,
    ) -> Result<RequestId, TransportError>;

    /// Sends one part of `mbuf` to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Again`] when the peer has no room.
    fn isend(
        &self,
        channel: &ChannelDesc,
        mbuf: &Mbuf,
        part: TransferPart,
    ) -> Result<RequestId, TransportError>;

    /// Sends the zero-length link message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the send cannot be posted.
    fn isend_link(&self, channel: &ChannelDesc) -> Result<RequestId, TransportError>;

    /// Returns the requests among `requests` that have finished.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the test itself failed.
    fn test_some(&self, requests: &[RequestId]) -> Result<Vec<Completion>, TransportError>;
}

/// The external primitives one router instance runs against.
#[derive(Clone)]
pub struct Drivers {
    pub queues: Arc<dyn QueueDriver>,
    pub pool: Arc<dyn BufferPool>,
    pub events: Arc<dyn EventWaiter>,
    pub transport: Arc<dyn TagTransport>,
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_errors_map_to_statuses() {
        assert_eq!(RouterError::from(DriverError::Full), RouterError::DriverError);
        assert_eq!(RouterError::from(DriverError::NoMemory), RouterError::InnerError);
        assert_eq!(RouterError::from(DriverError::NotExist), RouterError::ParamInvalid);
    }

    #[test]
    fn test_zero_length_envelope_is_link() {
        assert!(Envelope { message: 1, len: 0 }.is_link());
        assert!(!Envelope { message: 1, len: 8 }.is_link());
    }
}
