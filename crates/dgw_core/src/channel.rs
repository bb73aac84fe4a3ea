//! Transport adapter of a channel entity.
//!
//! A channel feeding the router (send direction) probes the tagged
//! transport for envelopes and posts receives for them; a channel fed by the
//! router (recv direction) posts sends. Both keep their outstanding
//! requests in one FIFO of transfers, reconciled in batches.
//!
//! - Credit: receives in flight, bounded by the concurrency cap. Envelopes
//!   probed without credit wait in a bounded cache and are issued first
//!   once credit returns.
//! - Link: the zero-length message that announces a sender. A receiver is
//!   connected once it probes one; a sender once its own has completed.
//! - Every buffer the adapter allocates or is handed is freed exactly once,
//!   on completion, on failure, or in [`ChannelState::uninit`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dgw_entity::{ChannelDesc, RouterError, RouterResult};
use tracing::{debug, warn};

use crate::data_obj::DataObj;
use crate::driver::{Drivers, Envelope, RequestId, TagTransport, TransferPart, TransportError};
use crate::mbuf::{BufferPool, Mbuf, PRIVATE_HEADER_SIZE};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Unconnected,
    /// Link message posted, not yet completed.
    LinkSent,
    Connected,
}

/// Result of handing a message to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The peer has no room; retry after relief.
    DestFull,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Receive,
    Send,
    Link,
}

#[derive(Debug)]
struct Transfer {
    kind: TransferKind,
    data: Option<RequestId>,
    header: Option<RequestId>,
    mbuf: Option<Mbuf>,
    failed: bool,
}

impl Transfer {
    fn is_done(&self) -> bool {
        self.data.is_none() && self.header.is_none()
    }
}

/// A data part already posted for a message whose header part was refused.
#[derive(Debug)]
struct PartialSend {
    obj_id: u64,
    mbuf: Mbuf,
    data: RequestId,
}

pub struct ChannelState {
    desc: ChannelDesc,
    cap: usize,
    uncompleted: VecDeque<Transfer>,
    cache: VecDeque<Envelope>,
    cache_depth: usize,
    cached_req_count: usize,
    link: LinkStatus,
    partial: Option<PartialSend>,
    pool: Arc<dyn BufferPool>,
    transport: Arc<dyn TagTransport>,
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("tag", &self.desc.local_tag_id)
            .field("peer_rank", &self.desc.peer_rank_id)
            .field("link", &self.link)
            .field("uncompleted", &self.uncompleted.len())
            .field("cached", &self.cache.len())
            .field("credit_used", &self.cached_req_count)
            .finish_non_exhaustive()
    }
}

impl ChannelState {
    #[must_use]
    pub fn new(desc: ChannelDesc, drivers: &Drivers) -> Self {
        Self {
            desc,
            cap: desc.concurrency_cap(),
            uncompleted: VecDeque::with_capacity(desc.uncompleted_depth()),
            cache: VecDeque::with_capacity(desc.cache_depth()),
            cache_depth: desc.cache_depth(),
            cached_req_count: 0,
            link: LinkStatus::Unconnected,
            partial: None,
            pool: Arc::clone(&drivers.pool),
            transport: Arc::clone(&drivers.transport),
        }
    }

    #[must_use]
    pub fn desc(&self) -> &ChannelDesc {
        &self.desc
    }

    /// Concurrency cap.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.link
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link == LinkStatus::Connected
    }

    /// Receives in flight.
    #[must_use]
    pub fn active_receives(&self) -> usize {
        self.cached_req_count
    }

    /// Probed envelopes waiting for credit.
    #[must_use]
    pub fn cached_envelopes(&self) -> usize {
        self.cache.len()
    }

    /// Sends in flight, link message excluded.
    #[must_use]
    pub fn in_flight_sends(&self) -> usize {
        self.uncompleted
            .iter()
            .filter(|t| t.kind == TransferKind::Send)
            .count()
    }

    fn has_credit(&self) -> bool {
        self.cached_req_count < self.cap
    }

    // ── Receive side ────────────────────────────────────────────────────────

    /// Issues cached envelopes while credit lasts, then probes for new ones.
    /// Returns how many receives were posted.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when probing fails or a receive cannot be
    /// posted.
    pub fn probe(&mut self) -> Result<usize, TransportError> {
        let mut issued = self.promote_cached()?;
        while self.cache.len() < self.cache_depth {
            let Some(envelope) = self.transport.probe(&self.desc)? else {
                break;
            };
            if envelope.is_link() {
                if self.link != LinkStatus::Connected {
                    debug!(tag = self.desc.local_tag_id, peer = self.desc.peer_rank_id, "link connected");
                }
                self.link = LinkStatus::Connected;
                continue;
            }
            if self.has_credit() {
                self.issue_receive(envelope)?;
                issued += 1;
            } else {
                self.cache.push_back(envelope);
            }
        }
        Ok(issued)
    }

    fn promote_cached(&mut self) -> Result<usize, TransportError> {
        let mut issued = 0;
        while self.has_credit() {
            let Some(envelope) = self.cache.pop_front() else {
                break;
            };
            self.issue_receive(envelope)?;
            issued += 1;
        }
        Ok(issued)
    }

    /// Allocates `header + len` and posts the data receive, then the header
    /// receive. An envelope that cannot get a buffer goes back to the cache.
    fn issue_receive(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let mbuf = match self.pool.alloc(PRIVATE_HEADER_SIZE + envelope.len) {
            Ok(mbuf) => mbuf,
            Err(err) => {
                warn!(tag = self.desc.local_tag_id, %err, "no buffer for probed message");
                self.cache.push_front(envelope);
                return Err(TransportError::Again);
            }
        };
        let data = match self
            .transport
            .irecv(&self.desc, &envelope, &mbuf, TransferPart::Data)
        {
            Ok(request) => request,
            Err(err) => {
                self.pool.free(mbuf);
                return Err(err);
            }
        };
        self.cached_req_count += 1;
        match self
            .transport
            .irecv(&self.desc, &envelope, &mbuf, TransferPart::Header)
        {
            Ok(header) => {
                self.uncompleted.push_back(Transfer {
                    kind: TransferKind::Receive,
                    data: Some(data),
                    header: Some(header),
                    mbuf: Some(mbuf),
                    failed: false,
                });
                Ok(())
            }
            Err(err) => {
                // The data part is still in flight; the buffer goes with it.
                self.uncompleted.push_back(Transfer {
                    kind: TransferKind::Receive,
                    data: Some(data),
                    header: None,
                    mbuf: Some(mbuf),
                    failed: true,
                });
                Err(err)
            }
        }
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Tests every outstanding request once. Completed receives are
    /// returned in posting order; completed sends and failed transfers free
    /// their buffer. Cached envelopes are then issued into freed credit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the completion test fails; nothing is
    /// released then.
    pub fn reconcile(&mut self) -> Result<Vec<Mbuf>, TransportError> {
        let requests: Vec<RequestId> = self
            .uncompleted
            .iter()
            .flat_map(|t| t.data.into_iter().chain(t.header))
            .collect();
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for completion in self.transport.test_some(&requests)? {
            let Some(transfer) = self.uncompleted.iter_mut().find(|t| {
                t.data == Some(completion.request) || t.header == Some(completion.request)
            }) else {
                continue;
            };
            if transfer.data == Some(completion.request) {
                transfer.data = None;
            } else {
                transfer.header = None;
            }
            transfer.failed |= !completion.ok;
        }

        let mut received = Vec::new();
        let mut pending = VecDeque::with_capacity(self.uncompleted.len());
        for mut transfer in self.uncompleted.drain(..) {
            if !transfer.is_done() {
                pending.push_back(transfer);
                continue;
            }
            match transfer.kind {
                TransferKind::Receive => {
                    self.cached_req_count = self.cached_req_count.saturating_sub(1);
                    if let Some(mbuf) = transfer.mbuf.take() {
                        if transfer.failed {
                            self.pool.free(mbuf);
                        } else {
                            received.push(mbuf);
                        }
                    }
                }
                TransferKind::Send => {
                    if transfer.failed {
                        warn!(tag = self.desc.local_tag_id, peer = self.desc.peer_rank_id, "send completed with failure");
                    }
                    if let Some(mbuf) = transfer.mbuf.take() {
                        self.pool.free(mbuf);
                    }
                }
                TransferKind::Link => {
                    self.link = if transfer.failed {
                        LinkStatus::Unconnected
                    } else {
                        LinkStatus::Connected
                    };
                }
            }
        }
        self.uncompleted = pending;
        if let Err(err) = self.promote_cached() {
            debug!(tag = self.desc.local_tag_id, %err, "cached envelope not promoted");
        }
        Ok(received)
    }

    // ── Send side ───────────────────────────────────────────────────────────

    /// Posts the link message if the link is down.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the link message cannot be posted.
    pub fn ensure_link(&mut self) -> Result<(), TransportError> {
        if self.link != LinkStatus::Unconnected {
            return Ok(());
        }
        let request = self.transport.isend_link(&self.desc)?;
        self.uncompleted.push_back(Transfer {
            kind: TransferKind::Link,
            data: None,
            header: Some(request),
            mbuf: None,
            failed: false,
        });
        self.link = LinkStatus::LinkSent;
        Ok(())
    }

    /// Sends `obj` to the peer: data part, then header part. A data part
    /// already posted for `obj` is not sent again.
    pub fn send(&mut self, obj: &DataObj) -> SendOutcome {
        match self.ensure_link() {
            Ok(()) => {}
            Err(TransportError::Again) => return SendOutcome::DestFull,
            Err(TransportError::Failed(code)) => {
                warn!(tag = self.desc.local_tag_id, code, "link message failed");
                return SendOutcome::Failed;
            }
        }

        let (mbuf, data) = match self.partial.take() {
            Some(partial) if partial.obj_id == obj.id() => (partial.mbuf, partial.data),
            stale => {
                if let Some(stale) = stale {
                    self.abandon_partial(stale);
                }
                if self.in_flight_sends() >= self.cap {
                    return SendOutcome::DestFull;
                }
                let mbuf = match obj.share() {
                    Ok(mbuf) => mbuf,
                    Err(err) => {
                        warn!(obj = obj.id(), %err, "message buffer not shareable");
                        return SendOutcome::Failed;
                    }
                };
                match self.transport.isend(&self.desc, &mbuf, TransferPart::Data) {
                    Ok(request) => (mbuf, request),
                    Err(err) => {
                        self.pool.free(mbuf);
                        return Self::refused(err);
                    }
                }
            }
        };

        match self.transport.isend(&self.desc, &mbuf, TransferPart::Header) {
            Ok(header) => {
                self.uncompleted.push_back(Transfer {
                    kind: TransferKind::Send,
                    data: Some(data),
                    header: Some(header),
                    mbuf: Some(mbuf),
                    failed: false,
                });
                SendOutcome::Sent
            }
            Err(TransportError::Again) => {
                self.partial = Some(PartialSend {
                    obj_id: obj.id(),
                    mbuf,
                    data,
                });
                SendOutcome::DestFull
            }
            Err(err) => {
                self.abandon_partial(PartialSend {
                    obj_id: obj.id(),
                    mbuf,
                    data,
                });
                Self::refused(err)
            }
        }
    }

    fn refused(err: TransportError) -> SendOutcome {
        match err {
            TransportError::Again => SendOutcome::DestFull,
            TransportError::Failed(code) => {
                warn!(code, "send refused by transport");
                SendOutcome::Failed
            }
        }
    }

    /// Keeps the buffer of an orphaned data part until that part completes.
    fn abandon_partial(&mut self, partial: PartialSend) {
        self.uncompleted.push_back(Transfer {
            kind: TransferKind::Send,
            data: Some(partial.data),
            header: None,
            mbuf: Some(partial.mbuf),
            failed: true,
        });
    }

    /// Waits up to `timeout` for posted sends to complete, polling every
    /// 100µs.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Timeout`] if sends are still in flight, or
    /// [`RouterError::DriverError`] if the completion test fails.
    pub fn wait_output_completion(&mut self, timeout: Duration) -> RouterResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let received = self.reconcile().map_err(|_| RouterError::DriverError)?;
            for mbuf in received {
                self.pool.free(mbuf);
            }
            if self.in_flight_sends() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RouterError::Timeout);
            }
            std::thread::sleep(OUTPUT_POLL_INTERVAL);
        }
    }

    /// Frees every buffer still held and forgets all outstanding requests.
    pub fn uninit(&mut self) {
        let mut freed = 0;
        for mut transfer in self.uncompleted.drain(..) {
            if let Some(mbuf) = transfer.mbuf.take() {
                self.pool.free(mbuf);
                freed += 1;
            }
        }
        if let Some(partial) = self.partial.take() {
            self.pool.free(partial.mbuf);
            freed += 1;
        }
        self.cache.clear();
        self.cached_req_count = 0;
        self.link = LinkStatus::Unconnected;
        if freed > 0 {
            debug!(tag = self.desc.local_tag_id, freed, "channel buffers freed");
        }
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        self.uninit();
    }
}
