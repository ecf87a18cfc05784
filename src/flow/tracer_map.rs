//! Periodic kernel hashmap scrape.
//!
//! Drains the aggregated flow map on a fixed period, folds the per-CPU
//! copies of each flow into one observation and feeds the result to
//! the accounter. A final scrape runs on cancellation so kernel-side
//! flows are not lost at shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FlowMetrics, Record};
use crate::ebpf::FlowFetcher;
use crate::metrics::Metrics;

pub struct MapTracer {
    fetcher: Arc<dyn FlowFetcher>,
    evict_period: Duration,
    metrics: Arc<Metrics>,
}

impl MapTracer {
    pub fn new(
        fetcher: Arc<dyn FlowFetcher>,
        evict_period: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fetcher,
            evict_period,
            metrics,
        }
    }

    /// Scrape loop. Exits after one last scrape once `cancel` fires.
    pub async fn run(self, cancel: CancellationToken, output: mpsc::Sender<Vec<Record>>) {
        let mut ticker = tokio::time::interval(self.evict_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("map tracer cancelled, final scrape");
                    let batch = self.scrape();
                    if !batch.is_empty() {
                        let _ = output.send(batch).await;
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let batch = self.scrape();
                    if !batch.is_empty() && output.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn scrape(&self) -> Vec<Record> {
        self.fetcher.read_global_counters(&self.metrics);

        let flows = self.fetcher.lookup_and_delete(&self.metrics);

        let total_entries: usize = flows.values().map(Vec::len).sum();
        self.metrics.hashmap_entries.set(total_entries as f64);
        self.metrics.hashmap_unique_flows.set(flows.len() as f64);

        let batch: Vec<Record> = flows
            .into_iter()
            .filter_map(|(id, per_cpu)| {
                aggregate_per_cpu(&per_cpu).map(|m| Record::new(id, m))
            })
            .collect();

        if !batch.is_empty() {
            self.metrics
                .evictions_total
                .with_label_values(&["map"])
                .inc();
            self.metrics
                .evicted_flows_total
                .with_label_values(&["map"])
                .inc_by(batch.len() as f64);
        }

        batch
    }
}

/// Fold the per-CPU copies of one flow into a single observation:
/// counters are summed, the window spans the earliest start and the
/// latest end, flags are OR-ed and the largest RTT sample wins.
fn aggregate_per_cpu(per_cpu: &[FlowMetrics]) -> Option<FlowMetrics> {
    let (first, rest) = per_cpu.split_first()?;
    let mut folded = *first;
    for m in rest {
        folded.accumulate(m);
    }
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::fake::FakeFetcher;
    use crate::flow::{Direction, FlowId};
    use std::collections::HashMap;
    use std::net::IpAddr;

    fn id(port: u16) -> FlowId {
        FlowId {
            eth_protocol: 0x0800,
            direction: Direction::Egress,
            src_addr: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_addr: "10.0.0.2".parse::<IpAddr>().unwrap(),
            src_port: port,
            dst_port: 443,
            transport_protocol: 6,
            icmp_type: 0,
            icmp_code: 0,
            if_index: 1,
        }
    }

    #[test]
    fn test_per_cpu_aggregation() {
        let per_cpu = vec![
            FlowMetrics {
                bytes: 100,
                packets: 2,
                flags: 0b0010,
                start_mono_ts: 50,
                end_mono_ts: 100,
                flow_rtt_ns: 10,
                ..Default::default()
            },
            FlowMetrics {
                bytes: 40,
                packets: 1,
                flags: 0b0001,
                start_mono_ts: 20,
                end_mono_ts: 80,
                flow_rtt_ns: 30,
                ..Default::default()
            },
            // CPU that never saw the first packet of the window.
            FlowMetrics {
                bytes: 10,
                packets: 1,
                start_mono_ts: 0,
                end_mono_ts: 120,
                ..Default::default()
            },
        ];

        let folded = aggregate_per_cpu(&per_cpu).expect("aggregate");
        assert_eq!(folded.bytes, 150);
        assert_eq!(folded.packets, 4);
        assert_eq!(folded.flags, 0b0011);
        assert_eq!(folded.start_mono_ts, 20);
        assert_eq!(folded.end_mono_ts, 120);
        assert_eq!(folded.flow_rtt_ns, 30);
    }

    #[test]
    fn test_empty_per_cpu_yields_nothing() {
        assert!(aggregate_per_cpu(&[]).is_none());
    }

    #[tokio::test]
    async fn test_final_scrape_on_cancel() {
        let fetcher = Arc::new(FakeFetcher::new());
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));

        let mut flows = HashMap::new();
        flows.insert(
            id(1),
            vec![FlowMetrics {
                bytes: 500,
                packets: 1,
                ..Default::default()
            }],
        );
        fetcher.append_lookup_results(flows);

        let tracer = MapTracer::new(
            fetcher.clone(),
            Duration::from_secs(3600),
            metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);

        let handle = tokio::spawn(tracer.run(cancel.clone(), tx));

        // The first tick fires immediately and drains the queued scrape.
        let first = rx.recv().await.expect("immediate scrape");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].metrics.bytes, 500);

        let mut last = HashMap::new();
        last.insert(
            id(2),
            vec![FlowMetrics {
                bytes: 77,
                packets: 1,
                ..Default::default()
            }],
        );
        fetcher.append_lookup_results(last);

        cancel.cancel();
        let batch = rx.recv().await.expect("final scrape");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id.src_port, 2);
        handle.await.expect("task");
    }
}
