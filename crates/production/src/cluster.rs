//! Every replica of a cluster in one process.

use crate::client::ClusterClient;
use crate::config::{ClusterConfig, ConfigError};
use crate::metrics::Metrics;
use crate::queues::WorkQueues;
use crate::runtime::{ReplicaRuntime, RuntimeError, RuntimeOptions};
use crate::telemetry::{serve_metrics, TelemetryError};
use crate::thread_pools::{ThreadPoolError, ThreadPoolManager};
use crate::transport::InMemoryNetwork;
use crate::workload::genesis_balances;
use palisade_bft::LedgerContext;
use palisade_execution::{KvStore, SharedApplication};
use palisade_node::{Replica, ReplicaError};
use palisade_types::{
    ClientId, KeyPair, ReplicaId, ReplicaInfo, ShardId, StaticTopology, TopologyError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Starting balance of every workload account.
pub const GENESIS_BALANCE: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ThreadPool(#[from] ThreadPoolError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub struct LocalCluster {
    config: ClusterConfig,
    topology: StaticTopology,
    network: Arc<InMemoryNetwork>,
    metrics: Arc<Metrics>,
    runtimes: Vec<ReplicaRuntime>,
    _pools: ThreadPoolManager,
    io: tokio::runtime::Runtime,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("shards", &self.config.shards)
            .field("replicas", &self.runtimes.len())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    /// Validate `config`, start every replica and wire them together.
    pub fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        let pools = ThreadPoolManager::new(config.node.threads.clone())?;
        let io = pools.build_tokio_runtime()?;
        let metrics = Arc::new(Metrics::new()?);
        let network = Arc::new(InMemoryNetwork::new().with_metrics(metrics.clone()));

        let infos: Vec<ReplicaInfo> = (0..config.total_replicas())
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                shard: ShardId(i / config.replicas_per_shard),
                public_key: KeyPair::for_index(i).public_key(),
            })
            .collect();
        let topology = StaticTopology::new(ReplicaId(0), infos.clone())?;
        let balances = genesis_balances(config.key_space, GENESIS_BALANCE);

        let mut replicas = Vec::with_capacity(infos.len());
        for info in &infos {
            let application = SharedApplication::new(KvStore::with_balances(
                balances.iter().map(|(k, b)| (k.as_str(), *b)),
            ));
            let replica = Replica::new(
                config.node.replica_config(),
                Arc::new(topology.for_replica(info.id)?),
                KeyPair::for_index(info.id.0),
                Arc::new(LedgerContext::new()),
                application,
                Some(pools.speculation_pool().clone()),
            )?;
            let queues = Arc::new(WorkQueues::new());
            network.register_replica(info.id, queues.clone());
            replicas.push((Arc::new(replica), queues));
        }

        let options = RuntimeOptions {
            threads: config.node.threads.clone(),
            io: io.handle().clone(),
            metrics: Some(metrics.clone()),
        };
        let mut cluster = Self {
            config,
            topology,
            network,
            metrics,
            runtimes: Vec::with_capacity(replicas.len()),
            _pools: pools,
            io,
        };
        for (replica, queues) in replicas {
            let transport = cluster.network.clone();
            cluster
                .runtimes
                .push(ReplicaRuntime::spawn(replica, queues, transport, options.clone())?);
        }

        if let Some(port) = cluster.config.node.metrics_port {
            let metrics = cluster.metrics.clone();
            cluster.io.block_on(serve_metrics(port, metrics))?;
        }
        info!(
            shards = cluster.config.shards,
            replicas = cluster.runtimes.len(),
            "Local cluster started"
        );
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn topology(&self) -> &StaticTopology {
        &self.topology
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn runtimes(&self) -> &[ReplicaRuntime] {
        &self.runtimes
    }

    pub fn runtime(&self, replica: ReplicaId) -> Option<&ReplicaRuntime> {
        self.runtimes.iter().find(|r| r.replica_id() == replica)
    }

    /// Replicas of `shard`, by ID.
    pub fn shard_runtimes(&self, shard: ShardId) -> impl Iterator<Item = &ReplicaRuntime> {
        self.runtimes
            .iter()
            .filter(move |r| r.replica().shard() == shard)
    }

    pub fn client(&self, id: ClientId, shard: ShardId) -> ClusterClient {
        ClusterClient::new(
            id,
            shard,
            self.network.clone(),
            Arc::new(self.topology.clone()),
            self.config.client_timeout(),
        )
    }

    /// Stop every replica and report the first failure.
    pub fn shutdown(mut self) -> Result<(), ClusterError> {
        let runtimes = std::mem::take(&mut self.runtimes);
        for runtime in &runtimes {
            runtime.stop();
        }
        let mut first_error = None;
        for runtime in runtimes {
            if let Err(error) = runtime.join() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for runtime in &self.runtimes {
            runtime.stop();
        }
    }
}
