//! Runtime metrics on a Prometheus registry.
//!
//! Counters are labeled by message type or outcome reason; gauges by
//! replica, so one registry serves every replica of a process.

use palisade_bft::BftStats;
use palisade_core::{Outcome, WorkCategory};
use palisade_execution::ExecutionStats;
use palisade_types::ReplicaId;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

pub struct Metrics {
    registry: Registry,

    // === Dispatch ===
    pub messages_handled: IntCounterVec,
    pub requeues: IntCounterVec,
    pub drops: IntCounterVec,
    pub rejections: IntCounterVec,
    pub fatal: IntCounterVec,
    pub queue_depth: IntGaugeVec,

    // === Transport ===
    pub frames_sent: IntCounterVec,
    pub frames_dropped: IntCounterVec,

    // === Replica progress ===
    pub batches_executed: IntGaugeVec,
    pub requests_executed: IntGaugeVec,
    pub optimistic_merged: IntGaugeVec,
    pub optimistic_replayed: IntGaugeVec,
    pub stable_checkpoint: IntGaugeVec,
    pub view: IntGaugeVec,
    pub view_changes_started: IntGaugeVec,
    pub views_adopted: IntGaugeVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help).namespace("palisade"), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntGaugeVec> {
    let metric = IntGaugeVec::new(Opts::new(name, help).namespace("palisade"), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;
        Ok(Self {
            messages_handled: counter(r, "events_handled_total", "Events dispatched, by type", &["type"])?,
            requeues: counter(r, "requeues_total", "Events requeued, by reason", &["reason"])?,
            drops: counter(r, "drops_total", "Events dropped, by reason", &["reason"])?,
            rejections: counter(r, "rejections_total", "Events rejected, by reason", &["reason"])?,
            fatal: counter(r, "fatal_total", "Invariant violations that halted a replica", &["replica"])?,
            queue_depth: gauge(r, "queue_depth", "Pending events per work category", &["replica", "category"])?,

            frames_sent: counter(r, "frames_sent_total", "Frames handed to the transport", &["type"])?,
            frames_dropped: counter(r, "frames_dropped_total", "Frames lost to partitions or decode errors", &["reason"])?,

            batches_executed: gauge(r, "batches_executed", "Batches executed", &["replica"])?,
            requests_executed: gauge(r, "requests_executed", "Requests executed", &["replica"])?,
            optimistic_merged: gauge(r, "optimistic_merged", "Batches executed from speculated sets", &["replica"])?,
            optimistic_replayed: gauge(r, "optimistic_replayed", "Optimistic batches replayed sequentially", &["replica"])?,
            stable_checkpoint: gauge(r, "stable_checkpoint", "Stable watermark", &["replica"])?,
            view: gauge(r, "view", "Current view", &["replica"])?,
            view_changes_started: gauge(r, "view_change_votes", "View change votes cast", &["replica"])?,
            views_adopted: gauge(r, "views_adopted", "Views adopted through view change", &["replica"])?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count the outcome of dispatching an event of type `event_type`.
    pub fn record_outcome(&self, replica: ReplicaId, event_type: &str, outcome: &Outcome) {
        self.messages_handled.with_label_values(&[event_type]).inc();
        match outcome {
            Outcome::Handled(_) => {}
            Outcome::Requeue { reason, .. } => {
                self.requeues.with_label_values(&[reason.as_str()]).inc()
            }
            Outcome::Dropped(reason) => self.drops.with_label_values(&[reason.as_str()]).inc(),
            Outcome::Rejected(reason) => {
                self.rejections.with_label_values(&[reason.as_str()]).inc()
            }
            Outcome::Fatal(_) => self
                .fatal
                .with_label_values(&[&replica.0.to_string()])
                .inc(),
        }
    }

    pub fn record_frame_sent(&self, message_type: &str) {
        self.frames_sent.with_label_values(&[message_type]).inc();
    }

    /// Reasons: `"partition"`, `"decode"`, `"unknown_peer"`.
    pub fn record_frame_dropped(&self, reason: &str) {
        self.frames_dropped.with_label_values(&[reason]).inc();
    }

    pub fn set_queue_depth(&self, replica: ReplicaId, category: WorkCategory, depth: usize) {
        self.queue_depth
            .with_label_values(&[&replica.0.to_string(), category.as_str()])
            .set(depth as i64);
    }

    /// Publish a replica's progress counters.
    pub fn observe_replica(&self, replica: ReplicaId, bft: &BftStats, execution: &ExecutionStats) {
        let label = replica.0.to_string();
        let label = [label.as_str()];
        self.batches_executed
            .with_label_values(&label)
            .set(execution.batches as i64);
        self.requests_executed
            .with_label_values(&label)
            .set(execution.requests as i64);
        self.optimistic_merged
            .with_label_values(&label)
            .set(execution.merged as i64);
        self.optimistic_replayed
            .with_label_values(&label)
            .set(execution.replayed as i64);
        self.stable_checkpoint
            .with_label_values(&label)
            .set(bft.stable_through as i64);
        self.view.with_label_values(&label).set(bft.view as i64);
        self.view_changes_started
            .with_label_values(&label)
            .set(bft.view_change_votes as i64);
        self.views_adopted
            .with_label_values(&label)
            .set(bft.views_adopted as i64);
    }
}
