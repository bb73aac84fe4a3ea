//! In-flight messages.
//!
//! A [`DataObj`] wraps one dequeued buffer together with the recipients it
//! still has to reach. The buffer is released exactly once: when the object
//! is released explicitly, aborted, or dropped, whichever happens first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dgw_entity::{EntityKey, RouterError, RouterResult};

use crate::mbuf::{self, BufferPool, Mbuf, MbufHeader};

/// Delivery progress towards one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Delivered,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub key: EntityKey,
    pub delivery: Delivery,
}

/// A dynamic member selection the object is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaitedDecision {
    pub sched_key: u32,
    pub group_id: u32,
    /// Schedule generation the request was issued in.
    pub generation: u64,
}

/// Counts buffers taken and released by [`DataObj`]s.
#[derive(Debug, Default)]
pub struct DataObjTracker {
    created: AtomicU64,
    released: AtomicU64,
}

impl DataObjTracker {
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Objects whose buffer is still held.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }
}

pub struct DataObj {
    id: u64,
    src: EntityKey,
    mbuf: Option<Mbuf>,
    header: MbufHeader,
    recipients: Vec<Recipient>,
    resolved: bool,
    awaiting: Option<AwaitedDecision>,
    pool: Arc<dyn BufferPool>,
    tracker: Arc<DataObjTracker>,
}

impl std::fmt::Debug for DataObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObj")
            .field("id", &self.id)
            .field("src", &self.src)
            .field("trans_id", &self.header.trans_id)
            .field("recipients", &self.recipients)
            .field("awaiting", &self.awaiting)
            .field("released", &self.mbuf.is_none())
            .finish()
    }
}

impl DataObj {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn src(&self) -> EntityKey {
        self.src
    }

    #[must_use]
    pub fn trans_id(&self) -> u64 {
        self.header.trans_id
    }

    #[must_use]
    pub fn header(&self) -> &MbufHeader {
        &self.header
    }

    #[must_use]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Recipients not yet delivered or aborted, in resolution order.
    #[must_use]
    pub fn pending(&self) -> Vec<EntityKey> {
        self.recipients
            .iter()
            .filter(|r| r.delivery == Delivery::Pending)
            .map(|r| r.key)
            .collect()
    }

    /// Fixes the recipient list. Runs once per object.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InnerError`] if recipients were already set.
    pub fn set_recipients(&mut self, keys: Vec<EntityKey>) -> RouterResult<()> {
        if self.resolved {
            return Err(RouterError::InnerError);
        }
        self.recipients = keys
            .into_iter()
            .map(|key| Recipient {
                key,
                delivery: Delivery::Pending,
            })
            .collect();
        self.resolved = true;
        Ok(())
    }

    /// Parks the object until the decision service picks a member.
    pub fn defer(&mut self, decision: AwaitedDecision) {
        self.awaiting = Some(decision);
    }

    #[must_use]
    pub fn awaiting(&self) -> Option<AwaitedDecision> {
        self.awaiting
    }

    /// Adds the member chosen by the decision service. Only the first
    /// decision for the awaited group is taken; later ones return `false`.
    pub fn inject_decision(&mut self, group_id: u32, member: EntityKey) -> bool {
        match self.awaiting {
            Some(awaited) if awaited.group_id == group_id => {
                self.awaiting = None;
                self.recipients.push(Recipient {
                    key: member,
                    delivery: Delivery::Pending,
                });
                true
            }
            _ => false,
        }
    }

    /// Stops waiting for a decision on `group_id`, e.g. after its route was
    /// unbound.
    pub fn abandon_decision(&mut self, group_id: u32) -> bool {
        if self.awaiting.is_some_and(|a| a.group_id == group_id) {
            self.awaiting = None;
            return true;
        }
        false
    }

    /// Records the outcome for `key`. Unknown keys are ignored.
    pub fn mark(&mut self, key: EntityKey, delivery: Delivery) {
        if let Some(r) = self.recipients.iter_mut().find(|r| r.key == key) {
            r.delivery = delivery;
        }
    }

    /// Aborts every pending recipient matching `pred`. Returns how many.
    pub fn abort_where(&mut self, pred: impl Fn(&EntityKey) -> bool) -> usize {
        let mut aborted = 0;
        for r in &mut self.recipients {
            if r.delivery == Delivery::Pending && pred(&r.key) {
                r.delivery = Delivery::Aborted;
                aborted += 1;
            }
        }
        aborted
    }

    /// Resolved, not waiting for a decision, and nothing pending.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.resolved
            && self.awaiting.is_none()
            && self
                .recipients
                .iter()
                .all(|r| r.delivery != Delivery::Pending)
    }

    /// A new handle to the buffer for one recipient.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InnerError`] if the buffer was released or the
    /// pool refuses another reference.
    pub fn share(&self) -> RouterResult<Mbuf> {
        let mbuf = self.mbuf.as_ref().ok_or(RouterError::InnerError)?;
        self.pool.copy_ref(mbuf).map_err(RouterError::from)
    }

    #[must_use]
    pub fn mbuf(&self) -> Option<&Mbuf> {
        self.mbuf.as_ref()
    }

    /// Marks every pending recipient aborted and releases the buffer.
    pub fn abort(&mut self) {
        self.abort_where(|_| true);
        self.resolved = true;
        self.awaiting = None;
        self.release();
    }

    /// Frees the buffer. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(mbuf) = self.mbuf.take() {
            self.pool.free(mbuf);
            self.tracker.released.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.mbuf.is_none()
    }
}

impl Drop for DataObj {
    fn drop(&mut self) {
        self.release();
    }
}

/// Creates [`DataObj`]s and keeps their release accounting.
pub struct DataObjManager {
    pool: Arc<dyn BufferPool>,
    next_id: AtomicU64,
    tracker: Arc<DataObjTracker>,
}

impl DataObjManager {
    #[must_use]
    pub fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self {
            pool,
            next_id: AtomicU64::new(1),
            tracker: Arc::new(DataObjTracker::default()),
        }
    }

    /// Wraps a dequeued buffer. The buffer is freed if its header cannot be
    /// read.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InnerError`] for an unreadable header.
    pub fn create(&self, src: EntityKey, mbuf: Mbuf) -> RouterResult<DataObj> {
        let header = match mbuf::read_header(self.pool.as_ref(), &mbuf) {
            Ok(header) => header,
            Err(err) => {
                self.pool.free(mbuf);
                return Err(err.into());
            }
        };
        self.tracker.created.fetch_add(1, Ordering::AcqRel);
        Ok(DataObj {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            src,
            mbuf: Some(mbuf),
            header,
            recipients: Vec::new(),
            resolved: false,
            awaiting: None,
            pool: Arc::clone(&self.pool),
            tracker: Arc::clone(&self.tracker),
        })
    }

    #[must_use]
    pub fn tracker(&self) -> &DataObjTracker {
        &self.tracker
    }
}

impl std::fmt::Debug for DataObjManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObjManager")
            .field("live", &self.tracker.live())
            .finish_non_exhaustive()
    }
}
