//! Demo topology.
//!
//! Configures a small topology through the config protocol, exactly as an
//! external caller would, then feeds the ingress queues and drains the
//! egress queues from tokio tasks.
//!
//! ```text
//! queue:1@0 ──▶ group (hash) ──▶ queue:4@last, queue:5@last
//! queue:2@0 ──▶ queue:3@0
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use dgw_core::{ConfigServer, SimDrivers};
use dgw_entity::{EndpointId, EntityInfo, RoutePolicy, STATUS_OK};
use dgw_wire::client;
use dgw_wire::sub_events::{QUERY_CONFIG, QUERY_CONFIG_NUM, UPDATE_CONFIG};
use dgw_wire::{RoutePair, RouteQuery};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Capacity of every demo queue.
const QUEUE_CAPACITY: usize = 64;

/// Queues the demo feeds and drains.
#[derive(Debug, Clone)]
pub struct Topology {
    pub ingress: Vec<EndpointId>,
    pub egress: Vec<EndpointId>,
}

/// Creates the demo queues and configures the routes between them.
///
/// # Errors
///
/// Returns an error if a config request is rejected.
pub fn configure(server: &ConfigServer, sim: &SimDrivers, shard_count: usize) -> Result<Topology> {
    let last = u32::try_from(shard_count.saturating_sub(1))?;
    let ingress = vec![EndpointId::queue(0, 1), EndpointId::queue(0, 2)];
    let egress = vec![
        EndpointId::queue(last, 4),
        EndpointId::queue(last, 5),
        EndpointId::queue(0, 3),
    ];
    for &queue in ingress.iter().chain(&egress) {
        sim.queues.create_queue(queue, QUEUE_CAPACITY);
    }

    let members = [EntityInfo::queue(last, 4), EntityInfo::queue(last, 5)];
    let mut buf = client::add_group(RoutePolicy::Hash, &members)?;
    expect_ok("add group", server.handle(UPDATE_CONFIG, &mut buf))?;
    let group_id = client::read_group_id(&buf)?;
    info!(group_id, "demo group created");

    let routes = [
        RoutePair::new(
            EntityInfo::queue(0, 1),
            EntityInfo::group(last, group_id, RoutePolicy::Hash),
        ),
        RoutePair::new(EntityInfo::queue(0, 2), EntityInfo::queue(0, 3)),
    ];
    let mut buf = client::bind_routes(&routes)?;
    expect_ok("bind routes", server.handle(UPDATE_CONFIG, &mut buf))?;

    let mut buf = client::query_count_request(&RouteQuery::All)?;
    expect_ok("query count", server.handle(QUERY_CONFIG_NUM, &mut buf))?;
    let count = client::read_query_count(&buf)?;
    let mut buf = client::query_request(&RouteQuery::All, count)?;
    expect_ok("query routes", server.handle(QUERY_CONFIG, &mut buf))?;
    for (route, status) in client::read_query_routes(&buf)? {
        info!(src = %route.src.endpoint, dst = %route.dst.endpoint, ?status, "route");
    }

    Ok(Topology { ingress, egress })
}

fn expect_ok(what: &str, code: i32) -> Result<()> {
    if code != STATUS_OK {
        bail!("{what} rejected with status {code}");
    }
    Ok(())
}

/// Counters shared by the demo tasks.
#[derive(Debug, Default)]
pub struct Traffic {
    pub produced: AtomicU64,
    pub consumed: AtomicU64,
}

/// Puts `rate` messages per second into every ingress queue.
pub fn spawn_producer(
    sim: SimDrivers,
    topology: Topology,
    rate: u64,
    traffic: Arc<Traffic>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / rate.max(1)));
        let mut trans_id: u64 = 0;
        loop {
            ticker.tick().await;
            for &queue in &topology.ingress {
                trans_id += 1;
                match sim.produce(queue, trans_id, format!("message {trans_id}").as_bytes()) {
                    Ok(()) => {
                        traffic.produced.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => debug!(%queue, trans_id, %err, "ingress refused message"),
                }
            }
        }
    })
}

/// Drains the egress queues and logs the running totals.
pub fn spawn_consumer(sim: SimDrivers, topology: Topology, traffic: Arc<Traffic>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            for &queue in &topology.egress {
                let drained = sim.consume(queue).len() as u64;
                traffic.consumed.fetch_add(drained, Ordering::Relaxed);
            }
            info!(
                produced = traffic.produced.load(Ordering::Relaxed),
                consumed = traffic.consumed.load(Ordering::Relaxed),
                "traffic"
            );
        }
    })
}
