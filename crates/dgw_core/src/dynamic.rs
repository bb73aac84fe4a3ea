//! Dynamic scheduling client.
//!
//! A dynamic group leaves member selection to an external decision service.
//! Each schedule key names a request queue and a response queue; requests
//! and responses are MessagePack messages carried in mbufs.
//!
//! Stopping a key also stops the scheduling of every source configured with
//! it. Restarting clears the responses still queued for the key and opens a
//! new generation, so parked messages re-request their decision.

use std::sync::Arc;

use dashmap::DashMap;
use dgw_entity::{RouterError, RouterResult};
use dgw_wire::layout::DynamicSchedConfig;
use dgw_wire::{DecisionRequest, DecisionResponse};
use tracing::{debug, info, warn};

use crate::driver::QueueDriver;
use crate::mbuf::{self, BufferPool};

/// Transport to the decision service.
pub trait DecisionService: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RouterError`] if the request cannot be delivered.
    fn request(&self, config: &DynamicSchedConfig, request: &DecisionRequest) -> RouterResult<()>;

    /// Takes up to `max` responses.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the response queue cannot be read.
    fn poll(&self, config: &DynamicSchedConfig, max: usize) -> RouterResult<Vec<DecisionResponse>>;
}

/// Decision service reached through hardware queues.
pub struct QueueDecisionService {
    queues: Arc<dyn QueueDriver>,
    pool: Arc<dyn BufferPool>,
}

impl QueueDecisionService {
    #[must_use]
    pub fn new(queues: Arc<dyn QueueDriver>, pool: Arc<dyn BufferPool>) -> Self {
        Self { queues, pool }
    }
}

impl DecisionService for QueueDecisionService {
    fn request(&self, config: &DynamicSchedConfig, request: &DecisionRequest) -> RouterResult<()> {
        let bytes = dgw_wire::encode(request)?;
        let mbuf = mbuf::alloc_message(self.pool.as_ref(), request.trans_id, &bytes)?;
        self.queues
            .enqueue(config.request_queue(), mbuf)
            .map_err(|(err, mbuf)| {
                self.pool.free(mbuf);
                RouterError::from(err)
            })
    }

    fn poll(&self, config: &DynamicSchedConfig, max: usize) -> RouterResult<Vec<DecisionResponse>> {
        let mut responses = Vec::new();
        while responses.len() < max {
            let Some(mbuf) = self.queues.dequeue(config.response_queue())? else {
                break;
            };
            let data = mbuf::read_data(self.pool.as_ref(), &mbuf);
            self.pool.free(mbuf);
            match data.map_err(RouterError::from).and_then(|d| {
                dgw_wire::decode::<DecisionResponse>(&d).map_err(RouterError::from)
            }) {
                Ok(response) => responses.push(response),
                Err(err) => warn!(sched_key = config.sched_key, %err, "undecodable decision response dropped"),
            }
        }
        Ok(responses)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SchedState {
    config: Option<DynamicSchedConfig>,
    stopped: bool,
    generation: u64,
}

/// Per-key dynamic schedule state and the decision service behind it.
pub struct DynamicClient {
    schedules: DashMap<u32, SchedState>,
    service: Arc<dyn DecisionService>,
}

impl std::fmt::Debug for DynamicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicClient")
            .field("schedules", &self.schedules.len())
            .finish_non_exhaustive()
    }
}

impl DynamicClient {
    #[must_use]
    pub fn new(service: Arc<dyn DecisionService>) -> Self {
        Self {
            schedules: DashMap::new(),
            service,
        }
    }

    /// Installs or replaces the queues of a schedule key.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] when request and response share
    /// a queue.
    pub fn init(&self, config: DynamicSchedConfig) -> RouterResult<()> {
        if config.request_queue() == config.response_queue() {
            return Err(RouterError::ParamInvalid);
        }
        self.schedules.entry(config.sched_key).or_default().config = Some(config);
        info!(
            sched_key = config.sched_key,
            request_queue = %config.request_queue(),
            response_queue = %config.response_queue(),
            "dynamic schedule initialised"
        );
        Ok(())
    }

    /// Stops scheduling for every key in `keys`.
    pub fn stop(&self, keys: &[u32]) {
        for &key in keys {
            self.schedules.entry(key).or_default().stopped = true;
            info!(sched_key = key, "schedule stopped");
        }
    }

    /// Resumes the keys, dropping the responses still queued for them.
    /// Returns how many stale responses were dropped.
    pub fn restart(&self, keys: &[u32]) -> usize {
        let mut dropped = 0;
        for &key in keys {
            let config = {
                let mut state = self.schedules.entry(key).or_default();
                state.stopped = false;
                state.generation += 1;
                state.config
            };
            if let Some(config) = config {
                loop {
                    match self.service.poll(&config, usize::MAX) {
                        Ok(stale) if !stale.is_empty() => dropped += stale.len(),
                        Ok(_) => break,
                        Err(err) => {
                            warn!(sched_key = key, %err, "stale responses not cleared");
                            break;
                        }
                    }
                }
            }
            info!(sched_key = key, dropped, "schedule restarted");
        }
        dropped
    }

    #[must_use]
    pub fn is_stopped(&self, key: u32) -> bool {
        self.schedules.get(&key).is_some_and(|s| s.stopped)
    }

    /// Current generation of `key`; bumped by every restart.
    #[must_use]
    pub fn generation(&self, key: u32) -> u64 {
        self.schedules.get(&key).map_or(0, |s| s.generation)
    }

    #[must_use]
    pub fn is_configured(&self, key: u32) -> bool {
        self.schedules.get(&key).is_some_and(|s| s.config.is_some())
    }

    /// Sends a decision request and returns the generation it belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DynamicScheduleError`] for an unconfigured or
    /// stopped key, or the service's error.
    pub fn request(&self, request: &DecisionRequest) -> RouterResult<u64> {
        let (config, generation) = {
            let state = self
                .schedules
                .get(&request.sched_key)
                .ok_or(RouterError::DynamicScheduleError)?;
            if state.stopped {
                return Err(RouterError::DynamicScheduleError);
            }
            (
                state.config.ok_or(RouterError::DynamicScheduleError)?,
                state.generation,
            )
        };
        self.service.request(&config, request)?;
        debug!(
            sched_key = request.sched_key,
            src = request.src_global_id,
            group_id = request.group_id,
            trans_id = request.trans_id,
            "decision requested"
        );
        Ok(generation)
    }

    /// Takes up to `max_per_key` responses from every running key.
    #[must_use]
    pub fn poll(&self, max_per_key: usize) -> Vec<DecisionResponse> {
        let configs: Vec<DynamicSchedConfig> = self
            .schedules
            .iter()
            .filter(|s| !s.stopped)
            .filter_map(|s| s.config)
            .collect();
        let mut responses = Vec::new();
        for config in configs {
            match self.service.poll(&config, max_per_key) {
                Ok(batch) => responses.extend(batch),
                Err(err) => warn!(sched_key = config.sched_key, %err, "decision poll failed"),
            }
        }
        responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDrivers;
    use dgw_entity::EndpointId;

    fn config() -> DynamicSchedConfig {
        DynamicSchedConfig {
            sched_key: 1,
            request_queue_id: 50,
            request_resource: 0,
            response_queue_id: 51,
            response_resource: 0,
        }
    }

    fn setup() -> (SimDrivers, DynamicClient) {
        let sim = SimDrivers::new(1);
        sim.queues.create_queue(EndpointId::queue(0, 50), 16);
        sim.queues.create_queue(EndpointId::queue(0, 51), 256);
        let service = QueueDecisionService::new(sim.queues.clone(), sim.pool.clone());
        (sim, DynamicClient::new(Arc::new(service)))
    }

    fn request(trans_id: u64) -> DecisionRequest {
        DecisionRequest {
            sched_key: 1,
            src_global_id: 7,
            group_id: 2,
            trans_id,
            resource_index: 0,
        }
    }

    fn respond(sim: &SimDrivers, response: &DecisionResponse) {
        let bytes = dgw_wire::encode(response).unwrap();
        let mbuf = mbuf::alloc_message(sim.pool.as_ref(), 0, &bytes).unwrap();
        sim.queues.enqueue(EndpointId::queue(0, 51), mbuf).unwrap();
    }

    #[test]
    fn test_request_lands_on_request_queue() {
        let (sim, client) = setup();
        client.init(config()).unwrap();
        assert_eq!(client.request(&request(9)).unwrap(), 0);
        let queued = sim.queues.dequeue(EndpointId::queue(0, 50)).unwrap().unwrap();
        let data = mbuf::read_data(sim.pool.as_ref(), &queued).unwrap();
        let decoded: DecisionRequest = dgw_wire::decode(&data).unwrap();
        assert_eq!(decoded, request(9));
        sim.pool.free(queued);
    }

    #[test]
    fn test_unconfigured_or_stopped_key_rejected() {
        let (_sim, client) = setup();
        assert_eq!(client.request(&request(1)), Err(RouterError::DynamicScheduleError));
        client.init(config()).unwrap();
        client.stop(&[1]);
        assert!(client.is_stopped(1));
        assert_eq!(client.request(&request(1)), Err(RouterError::DynamicScheduleError));
    }

    #[test]
    fn test_same_queue_rejected() {
        let (_sim, client) = setup();
        let mut cfg = config();
        cfg.response_queue_id = cfg.request_queue_id;
        assert_eq!(client.init(cfg), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_poll_is_bounded_per_key() {
        let (sim, client) = setup();
        client.init(config()).unwrap();
        let resp = DecisionResponse::answer(&request(1), 0);
        for _ in 0..150 {
            respond(&sim, &resp);
        }
        assert_eq!(client.poll(100).len(), 100);
        assert_eq!(client.poll(100).len(), 50);
        assert_eq!(sim.pool.live(), 0);
    }

    #[test]
    fn test_restart_clears_responses_and_bumps_generation() {
        let (sim, client) = setup();
        client.init(config()).unwrap();
        client.stop(&[1]);
        respond(&sim, &DecisionResponse::answer(&request(1), 0));
        respond(&sim, &DecisionResponse::answer(&request(2), 1));
        assert!(client.poll(100).is_empty());
        assert_eq!(client.restart(&[1]), 2);
        assert!(!client.is_stopped(1));
        assert_eq!(client.generation(1), 1);
        assert!(client.poll(100).is_empty());
        assert_eq!(sim.pool.live(), 0);
    }
}
