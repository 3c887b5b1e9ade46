//! Palisade local cluster
//!
//! Runs every replica of a cluster in one process and drives a workload
//! against it.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: one shard of four replicas, four clients, ten seconds
//! palisade-cluster
//!
//! # From a configuration file, with overrides
//! palisade-cluster --config cluster.toml --duration 30 --clients 8
//!
//! # Serve Prometheus metrics while running
//! palisade-cluster --metrics-port 9090
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use palisade_execution::ExecutionStrategy;
use palisade_production::telemetry::DEFAULT_FILTER;
use palisade_production::{init_logging, ClusterConfig, LocalCluster, Workload};
use palisade_types::{ClientId, ShardId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Palisade local cluster
#[derive(Parser, Debug)]
#[command(name = "palisade-cluster")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of shards (overrides config)
    #[arg(long)]
    shards: Option<u64>,

    /// Replicas per shard (overrides config)
    #[arg(long)]
    replicas: Option<u64>,

    /// Concurrent workload clients (overrides config)
    #[arg(long)]
    clients: Option<u64>,

    /// Workload duration in seconds (overrides config)
    #[arg(long)]
    duration: Option<u64>,

    /// Use optimistic execution
    #[arg(long)]
    optimistic: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Workload seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = DEFAULT_FILTER)]
    log_filter: String,
}

impl Cli {
    fn cluster_config(&self) -> Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClusterConfig::default(),
        };
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
        if let Some(replicas) = self.replicas {
            config.replicas_per_shard = replicas;
        }
        if let Some(clients) = self.clients {
            config.clients = clients;
        }
        if let Some(duration) = self.duration {
            config.duration_secs = duration;
        }
        if self.optimistic {
            config.node.execution.mode = ExecutionStrategy::Optimistic;
        }
        if self.metrics_port.is_some() {
            config.node.metrics_port = self.metrics_port;
        }
        config.validate().context("invalid cluster configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_filter)?;
    let config = cli.cluster_config()?;
    let duration = config.duration();
    let batch_size = config.node.consensus.batch_size;

    let cluster = LocalCluster::start(config.clone()).context("starting cluster")?;

    let running = Arc::new(AtomicBool::new(true));
    let requests_done = Arc::new(AtomicU64::new(0));
    let batches_failed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    std::thread::scope(|scope| {
        for index in 0..config.clients {
            let shard = ShardId(index % config.shards);
            let mut client = cluster.client(ClientId(index + 1), shard);
            let mut workload = Workload::new(client.id(), cli.seed, config.key_space, batch_size);
            let (running, requests_done, batches_failed) =
                (running.clone(), requests_done.clone(), batches_failed.clone());
            scope.spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match client.submit(workload.next_batch()) {
                        Ok(reply) => {
                            requests_done.fetch_add(reply.results.len() as u64, Ordering::Relaxed);
                        }
                        Err(error) => {
                            warn!(client = client.id().0, %error, "Batch failed");
                            batches_failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }

        std::thread::sleep(duration);
        running.store(false, Ordering::Relaxed);
    });

    let elapsed = started.elapsed().as_secs_f64();
    let requests = requests_done.load(Ordering::Relaxed);
    for runtime in cluster.runtimes() {
        let stats = runtime.replica().stats();
        info!(
            replica = runtime.replica_id().0,
            view = stats.view,
            executed_through = stats.executed_through,
            stable_through = stats.stable_through,
            "Replica summary"
        );
    }
    cluster.shutdown().context("cluster shut down with errors")?;

    println!(
        "{} requests in {:.1}s ({:.0} req/s), {} failed batches",
        requests,
        elapsed,
        requests as f64 / elapsed.max(f64::EPSILON),
        batches_failed.load(Ordering::Relaxed)
    );
    Ok(())
}
