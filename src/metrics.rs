//! Bridge metrics for monitoring and observability.
//!
//! Counters are shared between the main context, its listeners and the loop
//! bridge. They are plain atomics so senders on SDK threads can bump them
//! without taking a lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// `attach()` calls
    pub attaches: u64,
    /// `detach()` calls that decremented the refcount
    pub detaches: u64,
    /// `detach()` calls made while already detached
    pub detach_underflows: u64,
    /// Poll steps run from the host loop
    pub ticks: u64,
    /// Source dispatches performed by the main context
    pub sources_dispatched: u64,
    /// Events handed to a listener
    pub events_dispatched: u64,
    /// Events dropped because the listener was gone
    pub events_dropped: u64,
    /// Events rejected because a listener queue was full
    pub queue_full: u64,
}

/// Metrics collector shared by the bridge components
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    attaches: AtomicU64,
    detaches: AtomicU64,
    detach_underflows: AtomicU64,
    ticks: AtomicU64,
    sources_dispatched: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    queue_full: AtomicU64,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attach(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_detach(&self) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_detach_underflow(&self) {
        self.detach_underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_source_dispatch(&self) {
        self.sources_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Poll steps run so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Events delivered to listeners so far
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attaches: self.attaches.load(Ordering::Relaxed),
            detaches: self.detaches.load(Ordering::Relaxed),
            detach_underflows: self.detach_underflows.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            sources_dispatched: self.sources_dispatched.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.attaches.store(0, Ordering::Relaxed);
        self.detaches.store(0, Ordering::Relaxed);
        self.detach_underflows.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.sources_dispatched.store(0, Ordering::Relaxed);
        self.events_dispatched.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.queue_full.store(0, Ordering::Relaxed);
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP artik_bridge_refcount_changes_total Bridge attach/detach calls\n");
        output.push_str("# TYPE artik_bridge_refcount_changes_total counter\n");
        output.push_str(&format!(
            "artik_bridge_refcount_changes_total{{op=\"attach\"}} {}\n",
            snapshot.attaches
        ));
        output.push_str(&format!(
            "artik_bridge_refcount_changes_total{{op=\"detach\"}} {}\n",
            snapshot.detaches
        ));
        output.push_str(&format!(
            "artik_bridge_refcount_changes_total{{op=\"underflow\"}} {}\n",
            snapshot.detach_underflows
        ));

        output.push_str("\n# HELP artik_bridge_ticks_total Poll steps run from the host loop\n");
        output.push_str("# TYPE artik_bridge_ticks_total counter\n");
        output.push_str(&format!("artik_bridge_ticks_total {}\n", snapshot.ticks));

        output.push_str("\n# HELP artik_bridge_sources_dispatched_total Main context dispatches\n");
        output.push_str("# TYPE artik_bridge_sources_dispatched_total counter\n");
        output.push_str(&format!(
            "artik_bridge_sources_dispatched_total {}\n",
            snapshot.sources_dispatched
        ));

        output.push_str("\n# HELP artik_bridge_events_total Listener events by outcome\n");
        output.push_str("# TYPE artik_bridge_events_total counter\n");
        output.push_str(&format!(
            "artik_bridge_events_total{{outcome=\"dispatched\"}} {}\n",
            snapshot.events_dispatched
        ));
        output.push_str(&format!(
            "artik_bridge_events_total{{outcome=\"dropped\"}} {}\n",
            snapshot.events_dropped
        ));
        output.push_str(&format!(
            "artik_bridge_events_total{{outcome=\"queue_full\"}} {}\n",
            snapshot.queue_full
        ));

        output
    }
}
