//! Export admission control.
//!
//! Protects the sink from flow storms by admitting at most
//! `max_records` per interval and dropping the excess.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use super::Record;
use crate::config::LimiterConfig;
use crate::metrics::Metrics;

pub struct CapacityLimiter {
    max_records: usize,
    interval: Duration,
    window_start: Instant,
    admitted_in_window: usize,
    dropped_in_window: usize,
    metrics: Arc<Metrics>,
}

impl CapacityLimiter {
    pub fn new(cfg: &LimiterConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            max_records: cfg.max_records,
            interval: cfg.interval,
            window_start: Instant::now(),
            admitted_in_window: 0,
            dropped_in_window: 0,
            metrics,
        }
    }

    /// Admit as much of the batch as the current window allows.
    pub fn admit(&mut self, mut batch: Vec<Record>) -> Vec<Record> {
        self.roll_window(Instant::now());

        let remaining = self.max_records.saturating_sub(self.admitted_in_window);
        let dropped = batch.len().saturating_sub(remaining);
        batch.truncate(remaining);

        self.admitted_in_window += batch.len();
        self.dropped_in_window += dropped;
        self.metrics.limiter_admitted_total.inc_by(batch.len() as f64);
        self.metrics.limiter_rejected_total.inc_by(dropped as f64);

        batch
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) < self.interval {
            return;
        }
        if self.dropped_in_window > 0 {
            warn!(
                dropped = self.dropped_in_window,
                max_records = self.max_records,
                interval = ?self.interval,
                "flow rate above export capacity, dropping records"
            );
        }
        self.window_start = now;
        self.admitted_in_window = 0;
        self.dropped_in_window = 0;
    }
}

/// Drive the limiter stage until the input closes.
pub async fn run(
    mut limiter: CapacityLimiter,
    mut input: mpsc::Receiver<Vec<Record>>,
    output: mpsc::Sender<Vec<Record>>,
) {
    while let Some(batch) = input.recv().await {
        let admitted = limiter.admit(batch);
        if !admitted.is_empty() && output.send(admitted).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowId, FlowMetrics};
    use std::net::IpAddr;

    fn limiter(max_records: usize, interval: Duration) -> CapacityLimiter {
        CapacityLimiter::new(
            &LimiterConfig {
                max_records,
                interval,
            },
            Arc::new(Metrics::new(":0").expect("metrics")),
        )
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(
                    FlowId {
                        eth_protocol: 0x0800,
                        direction: Direction::Egress,
                        src_addr: "10.0.0.1".parse::<IpAddr>().unwrap(),
                        dst_addr: "10.0.0.2".parse::<IpAddr>().unwrap(),
                        src_port: i as u16,
                        dst_port: 443,
                        transport_protocol: 6,
                        icmp_type: 0,
                        icmp_code: 0,
                        if_index: 1,
                    },
                    FlowMetrics::default(),
                )
            })
            .collect()
    }

    #[test]
    fn test_batch_within_capacity_passes_untouched() {
        let mut l = limiter(10, Duration::from_secs(60));
        assert_eq!(l.admit(records(10)).len(), 10);
    }

    #[test]
    fn test_excess_is_truncated_across_batches() {
        let mut l = limiter(5, Duration::from_secs(60));
        assert_eq!(l.admit(records(3)).len(), 3);
        // Only 2 slots left in this window.
        assert_eq!(l.admit(records(4)).len(), 2);
        assert!(l.admit(records(1)).is_empty());
    }

    #[test]
    fn test_window_roll_restores_capacity() {
        let mut l = limiter(2, Duration::from_millis(5));
        assert_eq!(l.admit(records(3)).len(), 2);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(l.admit(records(2)).len(), 2);
    }
}
