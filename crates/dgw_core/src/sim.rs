//! In-memory drivers.
//!
//! Reference implementations of every platform boundary, used by the tests
//! and the demo binary. They keep enough bookkeeping (live handles, double
//! frees, subscriptions) for tests to assert on resource handling, and
//! expose switches to inject failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dgw_entity::{ChannelDesc, EndpointId};
use parking_lot::{Condvar, Mutex};

use crate::driver::{
    Completion, DriverError, Drivers, Envelope, Event, EventKind, EventWaiter, QueueDriver,
    QueueStatus, RequestId, SubscribeKind, TagTransport, TransferPart, TransportError,
};
use crate::mbuf::{self, BufferPool, Mbuf, MbufHeader, PRIVATE_HEADER_SIZE};

// ── Buffer pool ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PoolState {
    next_handle: u64,
    next_block: u64,
    /// Live handle → block.
    handles: HashMap<u64, u64>,
    /// Block → (bytes, reference count).
    blocks: HashMap<u64, (Vec<u8>, usize)>,
    double_frees: usize,
}

/// Reference-counted pool with leak and double-free accounting.
#[derive(Debug, Default)]
pub struct SimBufferPool {
    state: Mutex<PoolState>,
    capacity: Option<usize>,
}

impl SimBufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool that refuses to hold more than `blocks` buffers.
    #[must_use]
    pub fn with_capacity(blocks: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            capacity: Some(blocks),
        }
    }

    /// Live handles.
    #[must_use]
    pub fn live(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Distinct buffers still allocated.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    #[must_use]
    pub fn double_frees(&self) -> usize {
        self.state.lock().double_frees
    }

    fn with_block<T>(
        &self,
        mbuf: &Mbuf,
        f: impl FnOnce(&mut Vec<u8>) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut state = self.state.lock();
        let block = *state
            .handles
            .get(&mbuf.raw())
            .ok_or(DriverError::InvalidBuffer)?;
        let (bytes, _) = state
            .blocks
            .get_mut(&block)
            .ok_or(DriverError::InvalidBuffer)?;
        f(bytes)
    }
}

impl BufferPool for SimBufferPool {
    fn alloc(&self, len: usize) -> Result<Mbuf, DriverError> {
        let mut state = self.state.lock();
        if self.capacity.is_some_and(|cap| state.blocks.len() >= cap) {
            return Err(DriverError::NoMemory);
        }
        state.next_handle += 1;
        state.next_block += 1;
        let (handle, block) = (state.next_handle, state.next_block);
        state.blocks.insert(block, (vec![0u8; len], 1));
        state.handles.insert(handle, block);
        Ok(Mbuf::from_raw(handle))
    }

    fn copy_ref(&self, mbuf: &Mbuf) -> Result<Mbuf, DriverError> {
        let mut state = self.state.lock();
        let block = *state
            .handles
            .get(&mbuf.raw())
            .ok_or(DriverError::InvalidBuffer)?;
        if let Some((_, refs)) = state.blocks.get_mut(&block) {
            *refs += 1;
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.handles.insert(handle, block);
        Ok(Mbuf::from_raw(handle))
    }

    fn free(&self, mbuf: Mbuf) {
        let mut state = self.state.lock();
        let Some(block) = state.handles.remove(&mbuf.raw()) else {
            state.double_frees += 1;
            return;
        };
        let last = match state.blocks.get_mut(&block) {
            Some((_, refs)) => {
                *refs -= 1;
                *refs == 0
            }
            None => false,
        };
        if last {
            state.blocks.remove(&block);
        }
    }

    fn write(&self, mbuf: &Mbuf, offset: usize, bytes: &[u8]) -> Result<(), DriverError> {
        self.with_block(mbuf, |data| {
            let slot = data
                .get_mut(offset..offset + bytes.len())
                .ok_or(DriverError::InvalidBuffer)?;
            slot.copy_from_slice(bytes);
            Ok(())
        })
    }

    fn read(&self, mbuf: &Mbuf, offset: usize, len: usize) -> Result<Vec<u8>, DriverError> {
        self.with_block(mbuf, |data| {
            data.get(offset..offset + len)
                .map(<[u8]>::to_vec)
                .ok_or(DriverError::InvalidBuffer)
        })
    }

    fn len(&self, mbuf: &Mbuf) -> Result<usize, DriverError> {
        self.with_block(mbuf, |data| Ok(data.len()))
    }
}

// ── Events ──────────────────────────────────────────────────────────────────

/// One condition-variable mailbox per shard.
#[derive(Debug)]
pub struct SimEvents {
    shards: Vec<(Mutex<VecDeque<Event>>, Condvar)>,
    fail_waits: AtomicBool,
}

impl SimEvents {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count)
                .map(|_| (Mutex::new(VecDeque::new()), Condvar::new()))
                .collect(),
            fail_waits: AtomicBool::new(false),
        }
    }

    /// Makes every wait fail until switched off.
    pub fn set_fail_waits(&self, fail: bool) {
        self.fail_waits.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn pending(&self, shard: usize) -> usize {
        self.shards.get(shard).map_or(0, |(queue, _)| queue.lock().len())
    }
}

impl EventWaiter for SimEvents {
    fn wait(&self, shard: usize, timeout: Duration) -> Result<Option<Event>, DriverError> {
        let (queue, ready) = self.shards.get(shard).ok_or(DriverError::NotExist)?;
        if self.fail_waits.load(Ordering::Acquire) {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            return Err(DriverError::Other(-1));
        }
        let deadline = Instant::now() + timeout;
        let mut events = queue.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Ok(Some(event));
            }
            if ready.wait_until(&mut events, deadline).timed_out() {
                return Ok(events.pop_front());
            }
        }
    }

    fn submit(&self, shard: usize, event: Event) -> Result<(), DriverError> {
        let (queue, ready) = self.shards.get(shard).ok_or(DriverError::NotExist)?;
        queue.lock().push_back(event);
        ready.notify_one();
        Ok(())
    }
}

// ── Queues ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimQueue {
    items: VecDeque<Mbuf>,
    capacity: usize,
    /// Subscribed kinds and whether each is paused.
    subs: HashMap<SubscribeKind, bool>,
    fail_status: bool,
    fail_enqueue: Option<DriverError>,
}

/// Bounded queues that raise events through a [`SimEvents`].
#[derive(Debug)]
pub struct SimQueues {
    queues: Mutex<HashMap<EndpointId, SimQueue>>,
    events: Arc<SimEvents>,
}

impl SimQueues {
    #[must_use]
    pub fn new(events: Arc<SimEvents>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn create_queue(&self, queue: EndpointId, capacity: usize) {
        self.queues.lock().insert(
            queue,
            SimQueue {
                items: VecDeque::new(),
                capacity,
                subs: HashMap::new(),
                fail_status: false,
                fail_enqueue: None,
            },
        );
    }

    #[must_use]
    pub fn depth(&self, queue: EndpointId) -> usize {
        self.queues.lock().get(&queue).map_or(0, |q| q.items.len())
    }

    #[must_use]
    pub fn is_subscribed(&self, queue: EndpointId, kind: SubscribeKind) -> bool {
        self.queues
            .lock()
            .get(&queue)
            .is_some_and(|q| q.subs.contains_key(&kind))
    }

    #[must_use]
    pub fn is_paused(&self, queue: EndpointId, kind: SubscribeKind) -> bool {
        self.queues
            .lock()
            .get(&queue)
            .and_then(|q| q.subs.get(&kind).copied())
            .unwrap_or(false)
    }

    /// Makes `status` fail for `queue`.
    pub fn set_fail_status(&self, queue: EndpointId, fail: bool) {
        if let Some(q) = self.queues.lock().get_mut(&queue) {
            q.fail_status = fail;
        }
    }

    /// Makes `enqueue` into `queue` fail with `err`.
    pub fn set_fail_enqueue(&self, queue: EndpointId, err: Option<DriverError>) {
        if let Some(q) = self.queues.lock().get_mut(&queue) {
            q.fail_enqueue = err;
        }
    }

    /// Frees every buffer still queued in `queue` and returns their headers.
    pub fn drain(&self, queue: EndpointId, pool: &dyn BufferPool) -> Vec<MbufHeader> {
        let items: Vec<Mbuf> = self
            .queues
            .lock()
            .get_mut(&queue)
            .map(|q| q.items.drain(..).collect())
            .unwrap_or_default();
        items
            .into_iter()
            .filter_map(|mbuf| {
                let header = mbuf::read_header(pool, &mbuf).ok();
                pool.free(mbuf);
                header
            })
            .collect()
    }

    fn notify(&self, queue: EndpointId, kind: EventKind) {
        let shard = queue.resource_index as usize;
        let _ = self.events.submit(shard, Event::on(kind, queue));
    }
}

impl QueueDriver for SimQueues {
    fn enqueue(&self, queue: EndpointId, mbuf: Mbuf) -> Result<(), (DriverError, Mbuf)> {
        let notify = {
            let mut queues = self.queues.lock();
            let Some(q) = queues.get_mut(&queue) else {
                return Err((DriverError::NotExist, mbuf));
            };
            if let Some(err) = q.fail_enqueue {
                return Err((err, mbuf));
            }
            if q.items.len() >= q.capacity {
                return Err((DriverError::Full, mbuf));
            }
            q.items.push_back(mbuf);
            q.subs.get(&SubscribeKind::Enqueue) == Some(&false)
        };
        if notify {
            self.notify(queue, EventKind::Enqueue);
        }
        Ok(())
    }

    fn dequeue(&self, queue: EndpointId) -> Result<Option<Mbuf>, DriverError> {
        let (mbuf, notify) = {
            let mut queues = self.queues.lock();
            let q = queues.get_mut(&queue).ok_or(DriverError::NotExist)?;
            let was_full = q.items.len() >= q.capacity;
            let mbuf = q.items.pop_front();
            let notify = was_full
                && mbuf.is_some()
                && q.subs.get(&SubscribeKind::FullToNotFull) == Some(&false);
            (mbuf, notify)
        };
        if notify {
            self.notify(queue, EventKind::FullToNotFull);
        }
        Ok(mbuf)
    }

    fn status(&self, queue: EndpointId) -> Result<QueueStatus, DriverError> {
        let queues = self.queues.lock();
        let q = queues.get(&queue).ok_or(DriverError::NotExist)?;
        if q.fail_status {
            return Err(DriverError::Other(-5));
        }
        Ok(QueueStatus {
            depth: q.items.len(),
            capacity: q.capacity,
        })
    }

    fn subscribe(&self, queue: EndpointId, kind: SubscribeKind) -> Result<(), DriverError> {
        let mut queues = self.queues.lock();
        let q = queues.get_mut(&queue).ok_or(DriverError::NotExist)?;
        q.subs.insert(kind, false);
        Ok(())
    }

    fn unsubscribe(&self, queue: EndpointId, kind: SubscribeKind) -> Result<(), DriverError> {
        let mut queues = self.queues.lock();
        let q = queues.get_mut(&queue).ok_or(DriverError::NotExist)?;
        q.subs.remove(&kind);
        Ok(())
    }

    fn set_paused(
        &self,
        queue: EndpointId,
        kind: SubscribeKind,
        paused: bool,
    ) -> Result<(), DriverError> {
        let mut queues = self.queues.lock();
        let q = queues.get_mut(&queue).ok_or(DriverError::NotExist)?;
        let slot = q.subs.get_mut(&kind).ok_or(DriverError::NotExist)?;
        *slot = paused;
        Ok(())
    }
}

// ── Tagged transport ────────────────────────────────────────────────────────

/// `(tag, sending rank, receiving rank)`.
type LinkKey = (u32, u32, u32);

#[derive(Debug, Clone)]
struct SimMessage {
    header: Vec<u8>,
    data: Vec<u8>,
    link: bool,
}

#[derive(Debug, Default)]
struct TransportState {
    next_id: u64,
    inbound: HashMap<LinkKey, VecDeque<SimMessage>>,
    /// Data parts sent whose header has not followed yet.
    partial: HashMap<LinkKey, Vec<u8>>,
    probed: HashMap<u64, SimMessage>,
    in_flight: HashSet<u64>,
    hold_completions: bool,
    fail_completions: bool,
    send_again: bool,
    send_failure: Option<i32>,
}

impl TransportState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn post(&mut self) -> RequestId {
        let id = self.next();
        self.in_flight.insert(id);
        RequestId(id)
    }
}

/// Loopback transport: what one rank sends on a tag, the peer rank probes on
/// the same tag.
#[derive(Debug)]
pub struct SimTransport {
    pool: Arc<SimBufferPool>,
    state: Mutex<TransportState>,
}

impl SimTransport {
    #[must_use]
    pub fn new(pool: Arc<SimBufferPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(TransportState::default()),
        }
    }

    /// Queues a message from the peer of `receiver`.
    pub fn inject(&self, receiver: &ChannelDesc, trans_id: u64, data: &[u8]) {
        let header = MbufHeader {
            trans_id,
            route_label: 0,
            data_len: u32::try_from(data.len()).unwrap_or(u32::MAX),
        };
        let message = SimMessage {
            header: header.encode().to_vec(),
            data: data.to_vec(),
            link: false,
        };
        self.state
            .lock()
            .inbound
            .entry(inbound_key(receiver))
            .or_default()
            .push_back(message);
    }

    /// Queues a link message from the peer of `receiver`.
    pub fn inject_link(&self, receiver: &ChannelDesc) {
        let message = SimMessage {
            header: Vec::new(),
            data: Vec::new(),
            link: true,
        };
        self.state
            .lock()
            .inbound
            .entry(inbound_key(receiver))
            .or_default()
            .push_back(message);
    }

    /// Data messages `sender` has delivered to its peer, oldest first, as
    /// `(transaction id, data)`. Link messages are skipped.
    #[must_use]
    pub fn delivered(&self, sender: &ChannelDesc) -> Vec<(u64, Vec<u8>)> {
        let key = (sender.local_tag_id, sender.local_rank_id, sender.peer_rank_id);
        self.state
            .lock()
            .inbound
            .get(&key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|m| !m.link)
                    .filter_map(|m| MbufHeader::decode(&m.header).map(|h| (h.trans_id, m.data.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// While set, posted requests never complete.
    pub fn set_hold_completions(&self, hold: bool) {
        self.state.lock().hold_completions = hold;
    }

    /// While set, completed requests report failure.
    pub fn set_fail_completions(&self, fail: bool) {
        self.state.lock().fail_completions = fail;
    }

    /// While set, sends report [`TransportError::Again`].
    pub fn set_send_again(&self, again: bool) {
        self.state.lock().send_again = again;
    }

    pub fn set_send_failure(&self, code: Option<i32>) {
        self.state.lock().send_failure = code;
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

fn inbound_key(receiver: &ChannelDesc) -> LinkKey {
    (receiver.local_tag_id, receiver.peer_rank_id, receiver.local_rank_id)
}

fn transport_failure(err: DriverError) -> TransportError {
    match err {
        DriverError::Other(code) => TransportError::Failed(code),
        _ => TransportError::Failed(-1),
    }
}

impl TagTransport for SimTransport {
    fn probe(&self, channel: &ChannelDesc) -> Result<Option<Envelope>, TransportError> {
        let mut state = self.state.lock();
        let Some(message) = state
            .inbound
            .get_mut(&inbound_key(channel))
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let id = state.next();
        if message.link {
            return Ok(Some(Envelope { message: id, len: 0 }));
        }
        let len = message.data.len();
        state.probed.insert(id, message);
        Ok(Some(Envelope { message: id, len }))
    }

    fn irecv(
        &self,
        _channel: &ChannelDesc,
        envelope: &Envelope,
        mbuf: &Mbuf,
        part: TransferPart,
    ) -> Result<RequestId, TransportError> {
        let mut state = self.state.lock();
        let message = state
            .probed
            .get(&envelope.message)
            .cloned()
            .ok_or(TransportError::Failed(-3))?;
        match part {
            TransferPart::Data => self
                .pool
                .write(mbuf, PRIVATE_HEADER_SIZE, &message.data)
                .map_err(transport_failure)?,
            TransferPart::Header => {
                self.pool
                    .write(mbuf, 0, &message.header)
                    .map_err(transport_failure)?;
                state.probed.remove(&envelope.message);
            }
        }
        Ok(state.post())
    }

    fn isend(
        &self,
        channel: &ChannelDesc,
        mbuf: &Mbuf,
        part: TransferPart,
    ) -> Result<RequestId, TransportError> {
        let mut state = self.state.lock();
        if state.send_again {
            return Err(TransportError::Again);
        }
        if let Some(code) = state.send_failure {
            return Err(TransportError::Failed(code));
        }
        let key = (channel.local_tag_id, channel.local_rank_id, channel.peer_rank_id);
        match part {
            TransferPart::Data => {
                let data = mbuf::read_data(self.pool.as_ref(), mbuf).map_err(transport_failure)?;
                state.partial.insert(key, data);
            }
            TransferPart::Header => {
                let header = self
                    .pool
                    .read(mbuf, 0, PRIVATE_HEADER_SIZE)
                    .map_err(transport_failure)?;
                let data = state.partial.remove(&key).unwrap_or_default();
                state.inbound.entry(key).or_default().push_back(SimMessage {
                    header,
                    data,
                    link: false,
                });
            }
        }
        Ok(state.post())
    }

    fn isend_link(&self, channel: &ChannelDesc) -> Result<RequestId, TransportError> {
        let mut state = self.state.lock();
        if state.send_again {
            return Err(TransportError::Again);
        }
        let key = (channel.local_tag_id, channel.local_rank_id, channel.peer_rank_id);
        state.inbound.entry(key).or_default().push_back(SimMessage {
            header: Vec::new(),
            data: Vec::new(),
            link: true,
        });
        Ok(state.post())
    }

    fn test_some(&self, requests: &[RequestId]) -> Result<Vec<Completion>, TransportError> {
        let mut state = self.state.lock();
        if state.hold_completions {
            return Ok(Vec::new());
        }
        let ok = !state.fail_completions;
        Ok(requests
            .iter()
            .filter(|request| state.in_flight.remove(&request.0))
            .map(|&request| Completion { request, ok })
            .collect())
    }
}

// ── Bundle ──────────────────────────────────────────────────────────────────

/// A full set of in-memory drivers sharing one pool and one event source.
#[derive(Debug, Clone)]
pub struct SimDrivers {
    pub pool: Arc<SimBufferPool>,
    pub events: Arc<SimEvents>,
    pub queues: Arc<SimQueues>,
    pub transport: Arc<SimTransport>,
}

impl SimDrivers {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let pool = Arc::new(SimBufferPool::new());
        let events = Arc::new(SimEvents::new(shard_count));
        let queues = Arc::new(SimQueues::new(Arc::clone(&events)));
        let transport = Arc::new(SimTransport::new(Arc::clone(&pool)));
        Self {
            pool,
            events,
            queues,
            transport,
        }
    }

    #[must_use]
    pub fn drivers(&self) -> Drivers {
        Drivers {
            queues: self.queues.clone(),
            pool: self.pool.clone(),
            events: self.events.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Producer side: puts a message with `trans_id` into `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if the buffer cannot be allocated or the
    /// queue refuses it.
    pub fn produce(&self, queue: EndpointId, trans_id: u64, data: &[u8]) -> Result<(), DriverError> {
        let mbuf = mbuf::alloc_message(self.pool.as_ref(), trans_id, data)?;
        self.queues.enqueue(queue, mbuf).map_err(|(err, mbuf)| {
            self.pool.free(mbuf);
            err
        })
    }

    /// Consumer side: takes every message from `queue` and frees it.
    #[must_use]
    pub fn consume(&self, queue: EndpointId) -> Vec<MbufHeader> {
        self.queues.drain(queue, self.pool.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_detects_double_free() {
        let pool = SimBufferPool::new();
        let mbuf = pool.alloc(4).unwrap();
        let raw = mbuf.raw();
        pool.free(mbuf);
        pool.free(Mbuf::from_raw(raw));
        assert_eq!(pool.double_frees(), 1);
    }

    #[test]
    fn test_copy_ref_keeps_block_alive() {
        let pool = SimBufferPool::new();
        let a = pool.alloc(4).unwrap();
        pool.write(&a, 0, &[1, 2, 3, 4]).unwrap();
        let b = pool.copy_ref(&a).unwrap();
        pool.free(a);
        assert_eq!(pool.blocks(), 1);
        assert_eq!(pool.read(&b, 0, 4).unwrap(), vec![1, 2, 3, 4]);
        pool.free(b);
        assert_eq!(pool.blocks(), 0);
    }

    #[test]
    fn test_queue_raises_subscribed_events() {
        let sim = SimDrivers::new(1);
        let q = EndpointId::queue(0, 1);
        sim.queues.create_queue(q, 1);
        sim.queues.subscribe(q, SubscribeKind::Enqueue).unwrap();
        sim.queues.subscribe(q, SubscribeKind::FullToNotFull).unwrap();
        sim.produce(q, 1, b"a").unwrap();
        assert_eq!(sim.produce(q, 2, b"b"), Err(DriverError::Full));
        let event = sim.events.wait(0, Duration::from_millis(1)).unwrap();
        assert_eq!(event, Some(Event::on(EventKind::Enqueue, q)));
        let mbuf = sim.queues.dequeue(q).unwrap().unwrap();
        sim.pool.free(mbuf);
        let event = sim.events.wait(0, Duration::from_millis(1)).unwrap();
        assert_eq!(event, Some(Event::on(EventKind::FullToNotFull, q)));
        assert_eq!(sim.pool.live(), 0);
    }

    #[test]
    fn test_paused_subscription_is_silent() {
        let sim = SimDrivers::new(1);
        let q = EndpointId::queue(0, 1);
        sim.queues.create_queue(q, 4);
        sim.queues.subscribe(q, SubscribeKind::Enqueue).unwrap();
        sim.queues.set_paused(q, SubscribeKind::Enqueue, true).unwrap();
        sim.produce(q, 1, b"a").unwrap();
        assert_eq!(sim.events.pending(0), 0);
        let _ = sim.consume(q);
    }

    #[test]
    fn test_wait_times_out_empty() {
        let events = SimEvents::new(1);
        assert_eq!(events.wait(0, Duration::from_millis(2)).unwrap(), None);
        assert!(events.wait(3, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_transport_loops_back_to_peer() {
        let sim = SimDrivers::new(1);
        let tx = ChannelDesc {
            comm_handle: 1,
            local_tag_id: 3,
            peer_tag_id: 3,
            local_rank_id: 0,
            peer_rank_id: 1,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        };
        let rx = ChannelDesc {
            local_rank_id: 1,
            peer_rank_id: 0,
            ..tx
        };
        let mbuf = mbuf::alloc_message(sim.pool.as_ref(), 42, b"hi").unwrap();
        sim.transport.isend(&tx, &mbuf, TransferPart::Data).unwrap();
        sim.transport.isend(&tx, &mbuf, TransferPart::Header).unwrap();
        sim.pool.free(mbuf);
        assert_eq!(sim.transport.delivered(&tx), vec![(42, b"hi".to_vec())]);

        let envelope = sim.transport.probe(&rx).unwrap().unwrap();
        assert_eq!(envelope.len, 2);
        let target = sim.pool.alloc(PRIVATE_HEADER_SIZE + envelope.len).unwrap();
        sim.transport
            .irecv(&rx, &envelope, &target, TransferPart::Data)
            .unwrap();
        sim.transport
            .irecv(&rx, &envelope, &target, TransferPart::Header)
            .unwrap();
        assert_eq!(mbuf::read_header(sim.pool.as_ref(), &target).unwrap().trans_id, 42);
        assert_eq!(mbuf::read_data(sim.pool.as_ref(), &target).unwrap(), b"hi");
        sim.pool.free(target);
    }
}
