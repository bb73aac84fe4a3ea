//! Scheduler workers.
//!
//! Each shard gets `workers_per_shard` OS threads. A worker blocks on the
//! shard's event source; a timeout is an ordinary wakeup that runs a pass.
//! Only one worker per shard runs a pass at a time, a worker that finds the
//! pass taken leaves a rerun request for the holder instead.
//!
//! A pass ([`schedule_data_buff_all`]) runs in fixed order:
//!
//! 1. Channel maintenance: reconcile transfers, probe for envelopes.
//! 2. Relief of FULL entities, destinations first.
//! 3. `PUSH` into every committed source of the shard, in topological order.
//! 4. Dynamic decision responses.
//! 5. A receive request when data moved and envelopes still wait in a cache.
//! 6. Quarantine of the shard's faulted relations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use dgw_entity::{Direction, EndpointId, EntityType, RouterError, RouterResult};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::RouterContext;
use crate::driver::{Event, EventKind, QueueStatus};
use crate::entity::Entity;
use crate::fsm::{Fsm, FsmMessage, FsmState};

/// Runs the scheduler workers of one router instance.
pub struct Scheduler {
    ctx: Arc<RouterContext>,
    instance_id: String,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance_id", &self.instance_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self {
            ctx,
            instance_id: Uuid::new_v4().to_string(),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InnerError`] if the scheduler already runs or
    /// a thread cannot be spawned; workers already spawned are stopped.
    pub fn start(&self) -> RouterResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RouterError::InnerError);
        }
        let config = self.ctx.config();
        let mut workers = self.workers.lock();
        for shard in 0..config.shard_count {
            for worker in 0..config.workers_per_shard {
                let ctx = Arc::clone(&self.ctx);
                let running = Arc::clone(&self.running);
                let spawned = std::thread::Builder::new()
                    .name(format!("dgw-shard{shard}-w{worker}"))
                    .spawn(move || worker_loop(&ctx, &running, shard));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => {
                        error!(shard, worker, %err, "worker spawn failed");
                        drop(workers);
                        self.stop();
                        self.wait_for_stop();
                        return Err(RouterError::InnerError);
                    }
                }
            }
        }
        info!(
            instance_id = %self.instance_id,
            shards = config.shard_count,
            workers = workers.len(),
            "scheduler started"
        );
        Ok(())
    }

    /// Asks the workers to exit. They notice within one wait timeout, or at
    /// once when woken by the event submitted here.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let config = self.ctx.config();
        for shard in 0..config.shard_count {
            for _ in 0..config.workers_per_shard {
                if let Err(err) = self
                    .ctx
                    .drivers()
                    .events
                    .submit(shard, Event::new(EventKind::CongestionRelief))
                {
                    debug!(shard, %err, "stop wakeup dropped");
                }
            }
        }
        info!(instance_id = %self.instance_id, "scheduler stopping");
    }

    /// Joins every worker, then drains channel sends still in flight.
    pub fn wait_for_stop(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!(instance_id = %self.instance_id, "worker panicked");
            }
        }
        let timeout = self.ctx.config().output_completion_timeout();
        for shard in 0..self.ctx.config().shard_count {
            for slot in self.ctx.registry().channels(shard, Direction::Recv) {
                let mut entity = slot.lock();
                let Some(channel) = entity.channel_mut(self.ctx.drivers()) else {
                    continue;
                };
                if let Err(err) = channel.wait_output_completion(timeout) {
                    warn!(entity = %slot.key(), %err, "channel sends not drained");
                }
            }
        }
        info!(instance_id = %self.instance_id, "scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        if !self.workers.get_mut().is_empty() {
            self.wait_for_stop();
        }
    }
}

fn worker_loop(ctx: &RouterContext, running: &AtomicBool, shard: usize) {
    debug!(shard, "worker started");
    let timeout = ctx.config().wait_timeout();
    let mut wait_failed = false;
    while running.load(Ordering::Acquire) {
        match ctx.drivers().events.wait(shard, timeout) {
            Ok(event) => {
                if wait_failed {
                    info!(shard, "event wait recovered");
                    wait_failed = false;
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match event {
                    Some(event) => handle_event(ctx, shard, event),
                    None => {
                        run_pass(ctx, shard);
                    }
                }
            }
            Err(err) => {
                ctx.stats().record_wait_error();
                if !wait_failed {
                    error!(shard, %err, "event wait failed");
                    wait_failed = true;
                }
                std::thread::yield_now();
            }
        }
    }
    debug!(shard, "worker exited");
}

/// Dispatches one event of `shard`.
pub fn handle_event(ctx: &RouterContext, shard: usize, event: Event) {
    match event.kind {
        EventKind::Enqueue
        | EventKind::RecvRequest
        | EventKind::RecvCompletion
        | EventKind::SendCompletion
        | EventKind::CongestionRelief => {
            if event.kind == EventKind::CongestionRelief {
                ctx.registry().mark_full(shard);
            }
            run_pass(ctx, shard);
        }
        EventKind::FullToNotFull => {
            let Some(guard) = ctx.try_begin_pass(shard) else {
                if let Err(err) = ctx.drivers().events.submit(shard, event) {
                    warn!(shard, %err, "relief event dropped");
                }
                return;
            };
            if let Some(subject) = event.subject {
                relieve_destination(ctx, subject);
            }
            ctx.registry().mark_full(shard);
            schedule_data_buff_all(ctx, shard);
            finish_pass(ctx, shard, guard);
        }
        EventKind::Unknown(code) => {
            ctx.stats().record_unknown_event();
            error!(shard, code, status = RouterError::InnerError.code(), "unknown event");
        }
    }
}

/// Runs a pass over `shard` unless another worker is running one. Returns
/// whether this call ran it.
pub fn run_pass(ctx: &RouterContext, shard: usize) -> bool {
    let Some(guard) = ctx.try_begin_pass(shard) else {
        return false;
    };
    schedule_data_buff_all(ctx, shard);
    finish_pass(ctx, shard, guard);
    true
}

/// Repeats the pass while reruns were requested, and once more if one
/// arrived while the slot was being released.
fn finish_pass(ctx: &RouterContext, shard: usize, guard: crate::context::PassGuard<'_>) {
    while guard.take_rerun() {
        schedule_data_buff_all(ctx, shard);
    }
    drop(guard);
    if ctx.rerun_requested(shard) {
        run_pass(ctx, shard);
    }
}

/// One scheduling pass over the committed sources of `shard`.
pub fn schedule_data_buff_all(ctx: &RouterContext, shard: usize) {
    ctx.stats().record_pass();
    let graph = ctx.relation().committed();
    let fsm = ctx.fsm(&graph);

    let channels_busy = maintain_channels(ctx, shard);
    if ctx.registry().take_full_hint(shard) {
        relieve_full(ctx, &fsm, shard);
    }

    let dequeued_before = ctx.stats().snapshot().dequeued;
    let budget = ctx.config().push_budget;
    for src in graph.sources_in(u32::try_from(shard).unwrap_or(u32::MAX)) {
        let key = src.with_direction(Direction::Send);
        let Some(slot) = ctx.registry().get(&key) else {
            continue;
        };
        let mut entity = slot.lock();
        if entity.cur_state() == FsmState::Error || is_stopped(ctx, &entity) {
            continue;
        }
        push_source(&fsm, &mut entity, budget);
    }

    for response in ctx.dynamic().poll(ctx.config().max_responses_per_pass) {
        if let Some(src) = fsm.apply_decision(&response) {
            let target = src.resource_index() as usize;
            if target != shard {
                if let Err(err) = ctx
                    .drivers()
                    .events
                    .submit(target, Event::new(EventKind::Enqueue))
                {
                    debug!(shard = target, %err, "decision wakeup dropped");
                }
            }
        }
    }

    let moved = ctx.stats().snapshot().dequeued > dequeued_before;
    if moved && channels_busy {
        if let Err(err) = ctx
            .drivers()
            .events
            .submit(shard, Event::new(EventKind::RecvRequest))
        {
            debug!(shard, %err, "receive wakeup dropped");
        }
    }

    let quarantined = ctx.relation().update_relation(u32::try_from(shard).unwrap_or(u32::MAX));
    if quarantined > 0 {
        ctx.stats().record_quarantined(quarantined);
    }
}

fn is_stopped(ctx: &RouterContext, entity: &Entity) -> bool {
    entity
        .info()
        .sched_key
        .is_some_and(|key| ctx.dynamic().is_stopped(key))
}

/// Pushes up to `budget` messages out of one source.
fn push_source(fsm: &Fsm<'_>, entity: &mut Entity, budget: usize) {
    for _ in 0..budget {
        let scheduled = entity.schedule_count();
        if let Err(err) = fsm.process_message(entity, FsmMessage::Push) {
            debug!(entity = %entity.key(), %err, "push stopped");
            return;
        }
        match entity.cur_state() {
            FsmState::Idle if entity.schedule_count() == scheduled => return,
            FsmState::Full | FsmState::Error | FsmState::TryPush => return,
            _ => {}
        }
    }
}

/// Reconciles every channel of the shard and probes the receiving ones.
/// Returns whether envelopes are still waiting in a cache.
fn maintain_channels(ctx: &RouterContext, shard: usize) -> bool {
    if !ctx.registry().has_channels() {
        return false;
    }
    let mut cached = false;
    for slot in ctx.registry().channels(shard, Direction::Send) {
        let mut entity = slot.lock();
        let stopped = is_stopped(ctx, &entity);
        let Some(channel) = entity.channel_mut(ctx.drivers()) else {
            continue;
        };
        let received = match channel.reconcile() {
            Ok(received) => received,
            Err(err) => {
                warn!(entity = %slot.key(), %err, "receive completion test failed");
                Vec::new()
            }
        };
        if let Err(err) = channel.probe() {
            debug!(entity = %slot.key(), %err, "probe interrupted");
        }
        cached |= channel.cached_envelopes() > 0;
        if stopped {
            for mbuf in received {
                ctx.drivers().pool.free(mbuf);
            }
        } else {
            entity.recv_list.extend(received);
        }
    }
    for slot in ctx.registry().channels(shard, Direction::Recv) {
        let mut entity = slot.lock();
        let full = entity.cur_state() == FsmState::Full;
        let Some(channel) = entity.channel_mut(ctx.drivers()) else {
            continue;
        };
        match channel.reconcile() {
            Ok(received) => {
                for mbuf in received {
                    ctx.drivers().pool.free(mbuf);
                }
            }
            Err(err) => warn!(entity = %slot.key(), %err, "send completion test failed"),
        }
        if full && channel.in_flight_sends() < channel.cap() {
            ctx.registry().mark_full(shard);
        }
    }
    cached
}

/// Whether a FULL destination has room again.
fn has_room(ctx: &RouterContext, entity: &mut Entity) -> bool {
    match entity.entity_type() {
        EntityType::Queue => ctx
            .drivers()
            .queues
            .status(entity.key().endpoint)
            .is_ok_and(|status: QueueStatus| !status.is_full()),
        EntityType::Channel => entity
            .channel_mut(ctx.drivers())
            .is_some_and(|c| c.in_flight_sends() < c.cap()),
        EntityType::Group => true,
    }
}

/// Sends F2NF to the destination queue `subject` if it is FULL.
fn relieve_destination(ctx: &RouterContext, subject: EndpointId) {
    let key = subject.with_direction(Direction::Recv);
    let Some(slot) = ctx.registry().get(&key) else {
        return;
    };
    let graph = ctx.relation().committed();
    let mut entity = slot.lock();
    if entity.cur_state() == FsmState::Full {
        let _ = ctx.fsm(&graph).process_message(&mut entity, FsmMessage::F2nf);
        notify_other_shards(ctx, key.resource_index() as usize);
    }
}

/// Asks every other shard to re-check its FULL sources.
fn notify_other_shards(ctx: &RouterContext, shard: usize) {
    for other in (0..ctx.config().shard_count).filter(|s| *s != shard) {
        ctx.registry().mark_full(other);
        if let Err(err) = ctx
            .drivers()
            .events
            .submit(other, Event::new(EventKind::CongestionRelief))
        {
            debug!(shard = other, %err, "relief wakeup dropped");
        }
    }
}

/// Relieves FULL destinations that have room, then FULL sources whose
/// blocking recipient is no longer FULL. Anything still FULL re-arms the
/// hint for the next pass.
fn relieve_full(ctx: &RouterContext, fsm: &Fsm<'_>, shard: usize) {
    let mut still_full = false;
    let mut relieved = false;
    for slot in ctx.registry().entities(shard) {
        if slot.key().direction != Direction::Recv {
            continue;
        }
        let mut entity = slot.lock();
        if entity.cur_state() != FsmState::Full {
            continue;
        }
        if has_room(ctx, &mut entity) {
            let _ = fsm.process_message(&mut entity, FsmMessage::F2nf);
            relieved = true;
        } else {
            still_full = true;
        }
    }
    if relieved {
        notify_other_shards(ctx, shard);
    }
    for slot in ctx.registry().entities(shard) {
        if slot.key().direction != Direction::Send {
            continue;
        }
        let mut entity = slot.lock();
        if entity.cur_state() != FsmState::Full {
            continue;
        }
        let blocked = entity.blocked_on().and_then(|key| ctx.registry().get(&key));
        let clear = blocked.is_none_or(|recipient| recipient.lock().cur_state() != FsmState::Full);
        if clear {
            let _ = fsm.process_message(&mut entity, FsmMessage::F2nf);
        } else {
            still_full = true;
        }
    }
    if still_full {
        ctx.registry().mark_full(shard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::config::RouterConfig;
    use crate::sim::SimDrivers;
    use dgw_entity::{ChannelDesc, EntityInfo, RoutePolicy};

    fn setup(shards: usize) -> (SimDrivers, Arc<RouterContext>) {
        let sim = SimDrivers::new(shards);
        for shard in 0..shards as u32 {
            for id in 0..16 {
                sim.queues.create_queue(EndpointId::queue(shard, id), 4);
            }
        }
        let config = RouterConfig::default()
            .with_shard_count(shards)
            .with_wait_timeout(Duration::from_millis(5));
        let ctx = Arc::new(RouterContext::new(config, sim.drivers()));
        (sim, ctx)
    }

    fn q(shard: u32, id: u32) -> EntityInfo {
        EntityInfo::queue(shard, id)
    }

    #[test]
    fn test_pass_routes_pending_messages() {
        let (sim, ctx) = setup(1);
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        for tid in 1..=3 {
            sim.produce(q(0, 1).endpoint, tid, b"m").unwrap();
        }
        assert!(run_pass(&ctx, 0));
        let tids: Vec<u64> = sim.consume(q(0, 2).endpoint).iter().map(|h| h.trans_id).collect();
        assert_eq!(tids, vec![1, 2, 3]);
        assert_eq!(ctx.stats().snapshot().delivered, 3);
    }

    #[test]
    fn test_staged_unbind_keeps_delivering_until_order() {
        let (sim, ctx) = setup(1);
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().bind(&q(0, 1), &q(0, 3)).unwrap();
        ctx.relation().order().unwrap();
        ctx.relation().unbind(&q(0, 1), &q(0, 3)).unwrap();
        sim.produce(q(0, 1).endpoint, 1, b"m").unwrap();
        run_pass(&ctx, 0);
        assert_eq!(sim.consume(q(0, 2).endpoint).len(), 1);
        assert_eq!(sim.consume(q(0, 3).endpoint).len(), 1);

        ctx.relation().order().unwrap();
        sim.produce(q(0, 1).endpoint, 2, b"m").unwrap();
        run_pass(&ctx, 0);
        assert_eq!(sim.consume(q(0, 2).endpoint).len(), 1);
        assert!(sim.consume(q(0, 3).endpoint).is_empty());
        assert_eq!(sim.pool.live(), 0);
    }

    #[test]
    fn test_push_budget_bounds_one_pass() {
        let (sim, _) = setup(1);
        let config = RouterConfig::default().with_push_budget(2);
        let ctx = RouterContext::new(config, sim.drivers());
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        for tid in 1..=3 {
            sim.produce(q(0, 1).endpoint, tid, b"m").unwrap();
        }
        schedule_data_buff_all(&ctx, 0);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 2);
        schedule_data_buff_all(&ctx, 0);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 3);
    }

    #[test]
    fn test_full_destination_relieved_by_later_pass() {
        let (sim, ctx) = setup(1);
        sim.queues.create_queue(q(0, 2).endpoint, 1);
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.produce(q(0, 1).endpoint, 1, b"m").unwrap();
        sim.produce(q(0, 1).endpoint, 2, b"m").unwrap();
        run_pass(&ctx, 0);
        let src = ctx.registry().get(&q(0, 1).key(Direction::Send)).unwrap();
        assert_eq!(src.lock().cur_state(), FsmState::Full);

        assert_eq!(sim.consume(q(0, 2).endpoint).len(), 1);
        run_pass(&ctx, 0);
        assert_eq!(src.lock().cur_state(), FsmState::Idle);
        let rest = sim.consume(q(0, 2).endpoint);
        assert_eq!(rest.iter().map(|h| h.trans_id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(sim.pool.live(), 0);
    }

    #[test]
    fn test_faulted_entity_skipped_and_quarantined() {
        let (sim, ctx) = setup(1);
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.produce(q(0, 1).endpoint, 1, b"m").unwrap();
        sim.queues.set_fail_status(q(0, 1).endpoint, true);
        run_pass(&ctx, 0);
        let key = q(0, 1).key(Direction::Send);
        assert_eq!(
            ctx.registry().get(&key).unwrap().lock().cur_state(),
            FsmState::Error
        );
        let graph = ctx.relation().committed();
        assert!(graph.is_abnormal(q(0, 1).endpoint, q(0, 2).endpoint));
        assert_eq!(ctx.stats().snapshot().quarantined, 1);

        sim.queues.set_fail_status(q(0, 1).endpoint, false);
        sim.produce(q(0, 1).endpoint, 2, b"m").unwrap();
        run_pass(&ctx, 0);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 0);

        ctx.recover(key).unwrap();
        run_pass(&ctx, 0);
        assert_eq!(sim.consume(q(0, 2).endpoint).len(), 2);
    }

    #[test]
    fn test_stopped_schedule_key_skips_source() {
        let (sim, ctx) = setup(1);
        let src = q(0, 1).with_sched_key(3);
        ctx.relation().bind(&src, &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.produce(src.endpoint, 1, b"m").unwrap();
        ctx.dynamic().stop(&[3]);
        run_pass(&ctx, 0);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 0);
        ctx.dynamic().restart(&[3]);
        run_pass(&ctx, 0);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 1);
    }

    #[test]
    fn test_channel_source_feeds_queue() {
        let (sim, ctx) = setup(1);
        let desc = ChannelDesc {
            comm_handle: 1,
            local_tag_id: 5,
            peer_tag_id: 5,
            local_rank_id: 1,
            peer_rank_id: 0,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        };
        let chan = EntityInfo::channel(0, 3, desc);
        ctx.relation().bind(&chan, &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.transport.inject_link(&desc);
        for tid in 1..=3 {
            sim.transport.inject(&desc, tid, b"remote");
        }
        // Receives are posted in one pass and completed in the next.
        run_pass(&ctx, 0);
        run_pass(&ctx, 0);
        run_pass(&ctx, 0);
        let tids: Vec<u64> = sim.consume(q(0, 2).endpoint).iter().map(|h| h.trans_id).collect();
        assert_eq!(tids, vec![1, 2, 3]);
        let slot = ctx.registry().get(&chan.key(Direction::Send)).unwrap();
        assert!(slot.lock().channel().unwrap().is_connected());
    }

    #[test]
    fn test_unknown_event_is_counted() {
        let (_sim, ctx) = setup(1);
        handle_event(&ctx, 0, Event::new(EventKind::Unknown(77)));
        assert_eq!(ctx.stats().snapshot().unknown_events, 1);
    }

    #[test]
    fn test_relief_event_reaches_source_on_other_shard() {
        let (sim, ctx) = setup(2);
        sim.queues.create_queue(q(1, 2).endpoint, 1);
        ctx.relation().bind(&q(0, 1), &q(1, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.produce(q(0, 1).endpoint, 1, b"m").unwrap();
        sim.produce(q(0, 1).endpoint, 2, b"m").unwrap();
        run_pass(&ctx, 0);
        let src = ctx.registry().get(&q(0, 1).key(Direction::Send)).unwrap();
        assert_eq!(src.lock().cur_state(), FsmState::Full);

        assert_eq!(sim.consume(q(1, 2).endpoint).len(), 1);
        handle_event(&ctx, 1, Event::on(EventKind::FullToNotFull, q(1, 2).endpoint));
        assert!(sim.events.pending(0) > 0);
        handle_event(&ctx, 0, Event::new(EventKind::CongestionRelief));
        assert_eq!(src.lock().cur_state(), FsmState::Idle);
        assert_eq!(sim.queues.depth(q(1, 2).endpoint), 1);
    }

    #[test]
    fn test_relief_completes_when_a_wakeup_is_dropped() {
        // Shard 1 has no mailbox, so its relief wakeup cannot be submitted.
        let sim = SimDrivers::new(1);
        sim.queues.create_queue(q(0, 1).endpoint, 4);
        sim.queues.create_queue(q(0, 2).endpoint, 1);
        let config = RouterConfig::default().with_shard_count(2);
        let ctx = RouterContext::new(config, sim.drivers());
        ctx.relation().bind(&q(0, 1), &q(0, 2)).unwrap();
        ctx.relation().order().unwrap();
        sim.produce(q(0, 1).endpoint, 1, b"m").unwrap();
        sim.produce(q(0, 1).endpoint, 2, b"m").unwrap();
        run_pass(&ctx, 0);
        let src = ctx.registry().get(&q(0, 1).key(Direction::Send)).unwrap();
        assert_eq!(src.lock().cur_state(), FsmState::Full);

        assert_eq!(sim.consume(q(0, 2).endpoint).len(), 1);
        handle_event(&ctx, 0, Event::on(EventKind::FullToNotFull, q(0, 2).endpoint));
        assert_eq!(src.lock().cur_state(), FsmState::Idle);
        assert_eq!(sim.queues.depth(q(0, 2).endpoint), 1);
    }

    #[test]
    fn test_workers_route_until_stopped() {
        let (sim, ctx) = setup(2);
        let members = [q(1, 4), q(1, 5)];
        let id = ctx.relation().create_group(&members, RoutePolicy::Broadcast).unwrap();
        ctx.relation()
            .bind(&q(0, 1), &EntityInfo::group(1, id, RoutePolicy::Broadcast))
            .unwrap();
        ctx.relation().order().unwrap();

        let scheduler = Scheduler::new(Arc::clone(&ctx));
        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(RouterError::InnerError));
        sim.produce(q(0, 1).endpoint, 9, b"m").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sim.queues.depth(q(1, 5).endpoint) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop();
        scheduler.wait_for_stop();
        assert!(!scheduler.is_running());
        assert_eq!(sim.queues.depth(q(1, 4).endpoint), 1);
        assert_eq!(sim.queues.depth(q(1, 5).endpoint), 1);
    }
}
