//! Userspace flow aggregation.
//!
//! The accounter merges per-flow observations arriving from both
//! tracers into one entry per flow identity, flushes entries whose
//! active window elapsed, and stamps wall-clock bounds derived from
//! the boot-time offset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{boot_epoch, monotonic_now, FlowId, FlowMetrics, Record};
use crate::metrics::Metrics;

struct CacheEntry {
    metrics: FlowMetrics,
    /// Monotonic timestamp opening this entry's window, taken from the
    /// first observation. Later observations do not move it.
    created_mono_ns: u64,
}

pub struct Accounter {
    entries: HashMap<FlowId, CacheEntry>,
    max_entries: usize,
    active_timeout: Duration,
    /// Wall-clock instant of kernel monotonic zero, captured once at
    /// construction so every record of a run shares the same offset.
    boot_epoch: SystemTime,
    metrics: Arc<Metrics>,
}

impl Accounter {
    pub fn new(max_entries: usize, active_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self::with_boot_epoch(max_entries, active_timeout, metrics, boot_epoch())
    }

    /// Construction with a fixed boot offset, for deterministic tests.
    pub fn with_boot_epoch(
        max_entries: usize,
        active_timeout: Duration,
        metrics: Arc<Metrics>,
        boot_epoch: SystemTime,
    ) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries),
            max_entries,
            active_timeout,
            boot_epoch,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one observation into the cache.
    ///
    /// A new flow arriving while the cache is full is returned
    /// finalized so it still reaches the export path, at the cost of
    /// per-window aggregation for that flow.
    pub fn account(&mut self, record: Record) -> Option<Record> {
        if let Some(entry) = self.entries.get_mut(&record.id) {
            entry.metrics.accumulate(&record.metrics);
            return None;
        }

        if self.entries.len() >= self.max_entries {
            self.metrics.accounter_capacity_exceeded_total.inc();
            return Some(self.finalize(record.id, record.metrics));
        }

        self.entries.insert(
            record.id,
            CacheEntry {
                metrics: record.metrics,
                created_mono_ns: record.metrics.end_mono_ts,
            },
        );
        self.metrics.accounter_entries.set(self.entries.len() as f64);
        None
    }

    /// Evict entries whose active window elapsed since the window
    /// opened, measured against `now` on the kernel monotonic clock.
    /// A still-active flow is flushed all the same; its next
    /// observation opens a fresh window.
    pub fn flush_expired(&mut self, now: Duration) -> Vec<Record> {
        let deadline = now.saturating_sub(self.active_timeout).as_nanos() as u64;

        let expired: Vec<FlowId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.created_mono_ns <= deadline)
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                evicted.push(self.finalize(id, entry.metrics));
            }
        }

        self.observe_eviction(evicted.len());
        evicted
    }

    /// Evict everything, used at shutdown.
    pub fn flush_all(&mut self) -> Vec<Record> {
        let epoch = self.boot_epoch;
        let evicted: Vec<Record> = self
            .entries
            .drain()
            .map(|(id, e)| finalize_with_epoch(epoch, id, e.metrics))
            .collect();

        self.observe_eviction(evicted.len());
        evicted
    }

    fn finalize(&self, id: FlowId, metrics: FlowMetrics) -> Record {
        finalize_with_epoch(self.boot_epoch, id, metrics)
    }

    fn observe_eviction(&self, count: usize) {
        self.metrics.accounter_entries.set(self.entries.len() as f64);
        if count > 0 {
            self.metrics
                .evictions_total
                .with_label_values(&["accounter"])
                .inc();
            self.metrics
                .evicted_flows_total
                .with_label_values(&["accounter"])
                .inc_by(count as f64);
        }
    }
}

fn finalize_with_epoch(epoch: SystemTime, id: FlowId, metrics: FlowMetrics) -> Record {
    let mut record = Record::new(id, metrics);
    record.time_flow_start = epoch + Duration::from_nanos(metrics.start_mono_ts);
    record.time_flow_end = epoch + Duration::from_nanos(metrics.end_mono_ts);
    record
}

/// Drive the accounter stage until the tracer side closes the input.
///
/// Remaining entries are flushed on close so no flow is lost at
/// shutdown.
pub async fn run(
    mut accounter: Accounter,
    mut input: mpsc::Receiver<Vec<Record>>,
    output: mpsc::Sender<Vec<Record>>,
) {
    let mut ticker = tokio::time::interval(accounter.active_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            batch = input.recv() => {
                let Some(batch) = batch else {
                    let remaining = accounter.flush_all();
                    debug!(flows = remaining.len(), "accounter input closed, flushing");
                    if !remaining.is_empty() && output.send(remaining).await.is_err() {
                        warn!("record consumer dropped before final flush");
                    }
                    return;
                };

                let mut overflow = Vec::new();
                for record in batch {
                    if let Some(record) = accounter.account(record) {
                        overflow.push(record);
                    }
                }
                if !overflow.is_empty() && output.send(overflow).await.is_err() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let evicted = accounter.flush_expired(monotonic_now());
                if !evicted.is_empty() && output.send(evicted).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Direction;
    use std::net::IpAddr;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(":0").expect("metrics"))
    }

    fn id(src_port: u16) -> FlowId {
        FlowId {
            eth_protocol: 0x0800,
            direction: Direction::Egress,
            src_addr: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_addr: "10.0.0.2".parse::<IpAddr>().unwrap(),
            src_port,
            dst_port: 443,
            transport_protocol: 6,
            icmp_type: 0,
            icmp_code: 0,
            if_index: 2,
        }
    }

    fn observation(src_port: u16, bytes: u64, start_ns: u64, end_ns: u64) -> Record {
        Record::new(
            id(src_port),
            FlowMetrics {
                bytes,
                packets: 1,
                start_mono_ts: start_ns,
                end_mono_ts: end_ns,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_same_flow_aggregates_into_one_entry() {
        let mut acc = Accounter::new(10, Duration::from_secs(5), metrics());

        assert!(acc.account(observation(1000, 100, 10, 20)).is_none());
        assert!(acc.account(observation(1000, 50, 20, 30)).is_none());
        assert_eq!(acc.len(), 1);

        let records = acc.flush_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metrics.bytes, 150);
        assert_eq!(records[0].metrics.packets, 2);
        assert_eq!(records[0].metrics.start_mono_ts, 10);
        assert_eq!(records[0].metrics.end_mono_ts, 30);
    }

    #[test]
    fn test_capacity_overflow_emits_singleton() {
        let mut acc = Accounter::new(2, Duration::from_secs(5), metrics());

        assert!(acc.account(observation(1, 10, 1, 1)).is_none());
        assert!(acc.account(observation(2, 10, 1, 1)).is_none());

        // Third distinct flow does not fit; it is forwarded at once.
        let overflow = acc.account(observation(3, 10, 1, 1)).expect("singleton");
        assert_eq!(overflow.id.src_port, 3);
        assert_eq!(acc.len(), 2);

        // A known flow still aggregates while the cache is full.
        assert!(acc.account(observation(1, 5, 1, 2)).is_none());
    }

    #[test]
    fn test_flush_expired_respects_active_window() {
        let mut acc = Accounter::new(10, Duration::from_secs(5), metrics());

        let sec = 1_000_000_000u64;
        acc.account(observation(1, 10, sec, 2 * sec));
        acc.account(observation(2, 10, 9 * sec, 9 * sec));

        // At t=10s only the window opened at t=2s has elapsed.
        let evicted = acc.flush_expired(Duration::from_secs(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id.src_port, 1);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_active_flow_flushes_when_window_since_creation_elapses() {
        let mut acc = Accounter::new(10, Duration::from_secs(5), metrics());
        let sec = 1_000_000_000u64;

        // Window opens at t=1s; the flow keeps producing packets.
        acc.account(observation(1, 10, sec, sec));
        acc.account(observation(1, 10, 3 * sec, 3 * sec));
        assert!(acc.flush_expired(Duration::from_secs(5)).is_empty());

        acc.account(observation(1, 10, 5 * sec, 5 * sec));

        // Ongoing activity does not extend the window.
        let evicted = acc.flush_expired(Duration::from_secs(6));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].metrics.bytes, 30);
        assert_eq!(evicted[0].metrics.end_mono_ts, 5 * sec);

        // The next observation opens a fresh window.
        acc.account(observation(1, 10, 7 * sec, 7 * sec));
        assert!(acc.flush_expired(Duration::from_secs(8)).is_empty());
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_wall_clock_stamping_uses_boot_epoch() {
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut acc =
            Accounter::with_boot_epoch(10, Duration::from_secs(5), metrics(), epoch);

        acc.account(observation(1, 10, 1_000_000_000, 3_000_000_000));
        let records = acc.flush_all();

        assert_eq!(
            records[0].time_flow_start,
            epoch + Duration::from_secs(1)
        );
        assert_eq!(records[0].time_flow_end, epoch + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_run_flushes_remaining_on_close() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let acc = Accounter::new(10, Duration::from_secs(60), metrics());
        let handle = tokio::spawn(run(acc, in_rx, out_tx));

        in_tx
            .send(vec![observation(1, 10, 1, 1), observation(2, 20, 1, 1)])
            .await
            .expect("send");
        drop(in_tx);

        let batch = out_rx.recv().await.expect("final flush");
        assert_eq!(batch.len(), 2);
        handle.await.expect("task");
    }
}
