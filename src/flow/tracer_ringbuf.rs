//! Ring buffer reader.
//!
//! The kernel falls back to the ring buffer when a flow cannot be
//! aggregated in the hashmap. One dedicated blocking task loops the
//! fetcher's ring read, decodes each sample and forwards it to the
//! accounter as a singleton. The task ends when fetcher close makes
//! the read return an error.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{decode_raw_record, Record};
use crate::ebpf::FlowFetcher;
use crate::metrics::Metrics;

pub struct RingBufTracer {
    fetcher: Arc<dyn FlowFetcher>,
    metrics: Arc<Metrics>,
}

impl RingBufTracer {
    pub fn new(fetcher: Arc<dyn FlowFetcher>, metrics: Arc<Metrics>) -> Self {
        Self { fetcher, metrics }
    }

    /// Spawn the blocking reader and return its join handle.
    pub fn spawn(self, output: mpsc::Sender<Vec<Record>>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.read_loop(output))
    }

    fn read_loop(&self, output: mpsc::Sender<Vec<Record>>) {
        loop {
            let bytes = match self.fetcher.read_ring_buf() {
                Ok(bytes) => bytes,
                Err(e) => {
                    info!(reason = %e, "ring buffer reader stopping");
                    return;
                }
            };

            let (id, metrics) = match decode_raw_record(&bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.metrics.decode_errors_total.inc();
                    debug!(error = %e, len = bytes.len(), "undecodable ring buffer sample");
                    continue;
                }
            };

            self.metrics
                .evictions_total
                .with_label_values(&["ringbuffer"])
                .inc();
            self.metrics
                .evicted_flows_total
                .with_label_values(&["ringbuffer"])
                .inc_by(1.0);

            if output.blocking_send(vec![Record::new(id, metrics)]).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::fake::FakeFetcher;
    use crate::flow::{Direction, FlowId, FlowMetrics};
    use std::net::IpAddr;

    fn id() -> FlowId {
        FlowId {
            eth_protocol: 0x0800,
            direction: Direction::Ingress,
            src_addr: "2001:db8::1".parse::<IpAddr>().unwrap(),
            dst_addr: "2001:db8::2".parse::<IpAddr>().unwrap(),
            src_port: 53,
            dst_port: 41000,
            transport_protocol: 17,
            icmp_type: 0,
            icmp_code: 0,
            if_index: 4,
        }
    }

    #[tokio::test]
    async fn test_samples_are_decoded_and_forwarded() {
        let fetcher = Arc::new(FakeFetcher::new());
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));

        let flow_metrics = FlowMetrics {
            bytes: 120,
            packets: 1,
            errno: 7,
            ..Default::default()
        };
        fetcher.append_ring_buf_record(&id(), &flow_metrics);

        let (tx, mut rx) = mpsc::channel(4);
        let handle = RingBufTracer::new(fetcher.clone(), metrics).spawn(tx);

        let batch = rx.recv().await.expect("singleton");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id());
        assert_eq!(batch[0].metrics.errno, 7);

        fetcher.close();
        handle.await.expect("reader task");
    }

    #[tokio::test]
    async fn test_bad_sample_is_skipped() {
        let fetcher = Arc::new(FakeFetcher::new());
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));

        fetcher.append_ring_buf_bytes(vec![0u8; 3]);
        fetcher.append_ring_buf_record(&id(), &FlowMetrics::default());

        let (tx, mut rx) = mpsc::channel(4);
        let handle = RingBufTracer::new(fetcher.clone(), metrics.clone()).spawn(tx);

        // The truncated sample is dropped; the valid one follows.
        let batch = rx.recv().await.expect("valid record");
        assert_eq!(batch[0].id, id());
        assert_eq!(metrics.decode_errors_total.get(), 1.0);

        fetcher.close();
        handle.await.expect("reader task");
    }
}
