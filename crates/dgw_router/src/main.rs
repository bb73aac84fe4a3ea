//! # dgw_router
//!
//! Runs one router instance over in-memory drivers.
//!
//! ## Startup Sequence
//!
//! 1. Load the router config (JSON file, or defaults).
//! 2. Build the context and start one worker per shard.
//! 3. Configure the demo topology through the config protocol.
//! 4. Feed traffic until Ctrl-C or `--run-secs` elapses.
//! 5. Stop the workers, drain channel sends and log the statistics.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dgw_core::{ConfigServer, RouterConfig, RouterContext, Scheduler, SimDrivers};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dgw_router", about = "Data-plane router over in-memory drivers")]
struct Args {
    /// JSON router config; omitted keys keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_secs: Option<u64>,

    /// Messages per second fed into each ingress queue
    #[arg(long, default_value_t = 100)]
    rate: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dgw_router=info".parse()?)
                .add_directive("dgw_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    info!(?config, "router starting");

    let sim = SimDrivers::new(config.shard_count);
    let ctx = Arc::new(RouterContext::new(config.clone(), sim.drivers()));
    let scheduler = Scheduler::new(Arc::clone(&ctx));
    scheduler.start()?;
    info!(instance_id = scheduler.instance_id(), "scheduler running");

    let server = ConfigServer::new(Arc::clone(&ctx));
    let topology = demo::configure(&server, &sim, config.shard_count)?;
    let traffic = Arc::new(demo::Traffic::default());
    let producer = demo::spawn_producer(sim.clone(), topology.clone(), args.rate, Arc::clone(&traffic));
    let consumer = demo::spawn_consumer(sim.clone(), topology, Arc::clone(&traffic));

    match args.run_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
        }
    }

    producer.abort();
    consumer.abort();
    scheduler.stop();
    tokio::task::spawn_blocking(move || scheduler.wait_for_stop()).await?;

    let stats = serde_json::to_string(&ctx.stats().snapshot())?;
    info!(
        %stats,
        live_objects = ctx.data_objs().tracker().live(),
        buffers_in_use = sim.pool.live(),
        "router stopped"
    );
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<RouterConfig> {
    let Some(path) = path else {
        return Ok(RouterConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    RouterConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}
