//! Cross-interface flow deduplication.
//!
//! A flow crossing several instrumented interfaces (for example a veth
//! pair) is reported once per interface. In first-come mode the first
//! interface seen for a flow becomes canonical; later reports from
//! other interfaces are dropped or marked until the claim expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use super::{Direction, FlowId, FlowMetrics, Record};
use crate::config::DedupConfig;
use crate::ifaces::InterfaceNamer;
use crate::metrics::Metrics;

struct CacheEntry {
    if_index: u32,
    deadline: Instant,
    /// Counters of dropped duplicates awaiting the next canonical
    /// report of this flow, accumulated in merge mode only.
    pending: Option<FlowMetrics>,
}

pub struct Deduper {
    expiry: Duration,
    just_mark: bool,
    merge: bool,
    cache: HashMap<FlowId, CacheEntry>,
    namer: Arc<InterfaceNamer>,
    metrics: Arc<Metrics>,
}

/// Interface and direction differ between the duplicate reports of one
/// flow, so both are excluded from the lookup key.
fn dedup_key(id: &FlowId) -> FlowId {
    let mut key = *id;
    key.if_index = 0;
    key.direction = Direction::Ingress;
    key
}

impl Deduper {
    pub fn new(cfg: &DedupConfig, namer: Arc<InterfaceNamer>, metrics: Arc<Metrics>) -> Self {
        Self {
            expiry: cfg.expiry,
            just_mark: cfg.just_mark,
            merge: cfg.merge,
            cache: HashMap::new(),
            namer,
            metrics,
        }
    }

    /// Filter one batch, keeping eviction order of the survivors.
    pub fn process(&mut self, batch: Vec<Record>) -> Vec<Record> {
        let now = Instant::now();
        self.cache.retain(|_, e| e.deadline > now);

        let mut forwarded: Vec<Record> = Vec::with_capacity(batch.len());
        // Canonical records of this batch, for counter merging.
        let mut canonical_at: HashMap<FlowId, usize> = HashMap::new();

        for mut record in batch {
            let key = dedup_key(&record.id);

            match self.cache.get_mut(&key) {
                Some(entry) if entry.if_index == record.id.if_index => {
                    entry.deadline = now + self.expiry;
                    if let Some(pending) = entry.pending.take() {
                        record.metrics.accumulate(&pending);
                    }
                    canonical_at.insert(key, forwarded.len());
                    forwarded.push(record);
                }
                Some(entry) => {
                    entry.deadline = now + self.expiry;
                    debug!(
                        iface = %self.namer.name_of(record.id.if_index),
                        canonical = %self.namer.name_of(entry.if_index),
                        "duplicate flow report"
                    );
                    if self.just_mark {
                        record.duplicate = true;
                        forwarded.push(record);
                        continue;
                    }
                    if self.merge {
                        // Fold into the canonical record of this batch
                        // when it already passed, else hold the
                        // counters for its next report.
                        match canonical_at.get(&key) {
                            Some(&idx) => forwarded[idx].metrics.accumulate(&record.metrics),
                            None => entry
                                .pending
                                .get_or_insert_with(FlowMetrics::default)
                                .accumulate(&record.metrics),
                        }
                        self.metrics.dedup_merged_total.inc();
                    }
                    self.metrics.dedup_dropped_total.inc();
                }
                None => {
                    self.cache.insert(
                        key,
                        CacheEntry {
                            if_index: record.id.if_index,
                            deadline: now + self.expiry,
                            pending: None,
                        },
                    );
                    canonical_at.insert(key, forwarded.len());
                    forwarded.push(record);
                }
            }
        }

        forwarded
    }
}

/// Drive the dedup stage until the input closes.
pub async fn run(
    mut deduper: Deduper,
    mut input: mpsc::Receiver<Vec<Record>>,
    output: mpsc::Sender<Vec<Record>>,
) {
    while let Some(batch) = input.recv().await {
        let forwarded = deduper.process(batch);
        if !forwarded.is_empty() && output.send(forwarded).await.is_err() {
            return;
        }
    }
}
