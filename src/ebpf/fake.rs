//! In-process fetcher used by the pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{FlowFetcher, ShutdownErrors};
use crate::flow::{encode_raw_record, FlowId, FlowMetrics};
use crate::ifaces::Interface;
use crate::metrics::Metrics;

/// Poll granularity for the blocking ring read while waiting for close.
const RING_POLL: Duration = Duration::from_millis(50);

/// A [`FlowFetcher`] backed by queues the test fills by hand.
///
/// Each [`lookup_and_delete`](FlowFetcher::lookup_and_delete) call pops
/// one queued result set, mimicking the drain semantics of the kernel
/// map. Ring buffer records block the reader until pushed.
pub struct FakeFetcher {
    registered: Mutex<HashSet<Interface>>,
    lookup_results: Mutex<VecDeque<HashMap<FlowId, Vec<FlowMetrics>>>>,
    ring_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    ring_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    dns_sweeps: Mutex<Vec<Duration>>,
    closed: AtomicBool,
}

impl FakeFetcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            registered: Mutex::new(HashSet::new()),
            lookup_results: Mutex::new(VecDeque::new()),
            ring_tx: Mutex::new(Some(tx)),
            ring_rx: Mutex::new(rx),
            dns_sweeps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue the result set returned by the next map drain.
    pub fn append_lookup_results(&self, results: HashMap<FlowId, Vec<FlowMetrics>>) {
        self.lookup_results.lock().push_back(results);
    }

    /// Push one encoded record into the ring buffer stream.
    pub fn append_ring_buf_record(&self, id: &FlowId, metrics: &FlowMetrics) {
        self.append_ring_buf_bytes(encode_raw_record(id, metrics).to_vec());
    }

    /// Push raw bytes into the ring buffer stream, undecoded.
    pub fn append_ring_buf_bytes(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.ring_tx.lock().as_ref() {
            let _ = tx.send(bytes);
        }
    }

    pub fn registered_interfaces(&self) -> Vec<Interface> {
        self.registered.lock().iter().cloned().collect()
    }

    pub fn dns_sweeps(&self) -> Vec<Duration> {
        self.dns_sweeps.lock().clone()
    }
}

impl Default for FakeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowFetcher for FakeFetcher {
    fn attach_tcx(&self, iface: &Interface) -> Result<()> {
        self.registered.lock().insert(iface.clone());
        Ok(())
    }

    fn register(&self, iface: &Interface) -> Result<()> {
        self.registered.lock().insert(iface.clone());
        Ok(())
    }

    fn lookup_and_delete(&self, _metrics: &Metrics) -> HashMap<FlowId, Vec<FlowMetrics>> {
        self.lookup_results.lock().pop_front().unwrap_or_default()
    }

    fn read_global_counters(&self, _metrics: &Metrics) {}

    fn delete_stale_dns_entries(&self, timeout: Duration) {
        self.dns_sweeps.lock().push(timeout);
    }

    fn read_ring_buf(&self) -> Result<Vec<u8>> {
        let rx = self.ring_rx.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                // Drain whatever was pushed before close.
                match rx.try_recv() {
                    Ok(bytes) => return Ok(bytes),
                    Err(_) => bail!("ring buffer closed"),
                }
            }
            match rx.recv_timeout(RING_POLL) {
                Ok(bytes) => return Ok(bytes),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => bail!("ring buffer closed"),
            }
        }
    }

    fn close(&self) -> ShutdownErrors {
        self.closed.store(true, Ordering::Release);
        self.ring_tx.lock().take();
        self.registered.lock().clear();
        ShutdownErrors::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{decode_raw_record, Direction};
    use std::net::IpAddr;

    fn sample_id() -> FlowId {
        FlowId {
            eth_protocol: 0x0800,
            direction: Direction::Egress,
            src_addr: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_addr: "10.0.0.2".parse::<IpAddr>().unwrap(),
            src_port: 12345,
            dst_port: 443,
            transport_protocol: 6,
            icmp_type: 0,
            icmp_code: 0,
            if_index: 2,
        }
    }

    #[test]
    fn test_lookup_results_drain_in_order() {
        let fetcher = FakeFetcher::new();
        let metrics = Metrics::new(":0").expect("metrics");

        let mut first = HashMap::new();
        first.insert(sample_id(), vec![FlowMetrics::default()]);
        fetcher.append_lookup_results(first);

        assert_eq!(fetcher.lookup_and_delete(&metrics).len(), 1);
        assert!(fetcher.lookup_and_delete(&metrics).is_empty());
    }

    #[test]
    fn test_ring_buf_roundtrip_and_close() {
        let fetcher = FakeFetcher::new();
        let id = sample_id();
        let metrics = FlowMetrics {
            bytes: 1500,
            packets: 2,
            ..Default::default()
        };

        fetcher.append_ring_buf_record(&id, &metrics);
        let bytes = fetcher.read_ring_buf().expect("record");
        let (got_id, got_metrics) = decode_raw_record(&bytes).expect("decode");
        assert_eq!(got_id, id);
        assert_eq!(got_metrics.bytes, 1500);

        assert!(fetcher.close().is_empty());
        assert!(fetcher.read_ring_buf().is_err());
    }
}
