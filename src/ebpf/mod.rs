//! Kernel instrumentation.
//!
//! [`FlowFetcher`] is the seam between the capture pipeline and the
//! kernel programs. The real implementation lives behind the `bpf`
//! feature; tests use [`fake::FakeFetcher`].

pub mod fake;

#[cfg(feature = "bpf")]
pub mod tracer;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;

use crate::flow::{FlowId, FlowMetrics};
use crate::ifaces::Interface;
use crate::metrics::Metrics;

/// Index layout of the kernel global counters array. Must match the
/// `global_counters_key_t` enum compiled into the classifier.
pub const GLOBAL_COUNTERS_LEN: u32 = 5;

/// One slot of the kernel global counters array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCounter {
    /// The classifier could not create or update a hashmap entry and
    /// fell back to the ring buffer.
    CannotUpdateHashMap,
    /// The flow filter rejected a packet.
    FilterReject,
    /// The flow filter accepted a packet.
    FilterAccept,
    /// No flow filter rule matched a packet.
    FilterNoMatch,
    /// The kernel stack dropped a packet, seen by the drop tracepoint.
    PacketDrop,
}

impl GlobalCounter {
    pub const ALL: [GlobalCounter; GLOBAL_COUNTERS_LEN as usize] = [
        GlobalCounter::CannotUpdateHashMap,
        GlobalCounter::FilterReject,
        GlobalCounter::FilterAccept,
        GlobalCounter::FilterNoMatch,
        GlobalCounter::PacketDrop,
    ];

    pub fn key(&self) -> u32 {
        match self {
            GlobalCounter::CannotUpdateHashMap => 0,
            GlobalCounter::FilterReject => 1,
            GlobalCounter::FilterAccept => 2,
            GlobalCounter::FilterNoMatch => 3,
            GlobalCounter::PacketDrop => 4,
        }
    }

    /// Record the counter delta on the matching metric family.
    pub fn observe(&self, metrics: &Metrics, delta: u64) {
        if delta == 0 {
            return;
        }
        match self {
            GlobalCounter::CannotUpdateHashMap => metrics
                .kernel_flows_dropped_total
                .with_label_values(&["hashmap_update"])
                .inc_by(delta as f64),
            GlobalCounter::FilterReject => metrics
                .kernel_filter_events_total
                .with_label_values(&["reject"])
                .inc_by(delta as f64),
            GlobalCounter::FilterAccept => metrics
                .kernel_filter_events_total
                .with_label_values(&["accept"])
                .inc_by(delta as f64),
            GlobalCounter::FilterNoMatch => metrics
                .kernel_filter_events_total
                .with_label_values(&["nomatch"])
                .inc_by(delta as f64),
            GlobalCounter::PacketDrop => metrics.kernel_pkt_drops_total.inc_by(delta as f64),
        }
    }
}

/// Errors collected while releasing kernel resources.
///
/// Release keeps going after individual failures so every resource
/// gets its chance to be freed; the caller logs the collection once.
#[derive(Debug, Default)]
pub struct ShutdownErrors(Vec<anyhow::Error>);

impl ShutdownErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err:#}")?;
        }
        Ok(())
    }
}

/// Access to the kernel capture programs and their maps.
///
/// Implementations use interior mutability; one instance is shared by
/// the discovery task, both tracers, and shutdown.
pub trait FlowFetcher: Send + Sync {
    /// Attach the classifier to an interface using the TCX API.
    /// Attaching twice to the same interface must be a no-op.
    fn attach_tcx(&self, iface: &Interface) -> Result<()>;

    /// Attach through the legacy clsact qdisc path. Fallback for
    /// kernels without TCX support.
    fn register(&self, iface: &Interface) -> Result<()>;

    /// Drain the aggregated flow map. Entries are removed from the
    /// kernel as they are read; per-entry failures are counted and
    /// skipped. Values keep one element per CPU.
    fn lookup_and_delete(&self, metrics: &Metrics) -> HashMap<FlowId, Vec<FlowMetrics>>;

    /// Read and reset the kernel global counters, publishing deltas.
    fn read_global_counters(&self, metrics: &Metrics);

    /// Remove DNS correlation entries older than `timeout`.
    fn delete_stale_dns_entries(&self, timeout: Duration);

    /// Block until a raw record arrives on the ring buffer. Returns an
    /// error once the fetcher is closed.
    fn read_ring_buf(&self) -> Result<Vec<u8>>;

    /// Release every kernel resource in reverse attach order,
    /// collecting failures instead of stopping at the first.
    fn close(&self) -> ShutdownErrors;
}
