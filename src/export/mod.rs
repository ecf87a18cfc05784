//! Record export.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::flow::Record;
use crate::metrics::Metrics;

/// Sink consumes decorated record batches and exports them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Export one batch. Records within a batch keep their eviction
    /// order.
    fn export(&mut self, batch: Vec<Record>) -> Result<()>;
}

/// Writes each record as a structured log line. The default sink.
pub struct LogSink {
    metrics: Arc<Metrics>,
}

impl LogSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn export(&mut self, batch: Vec<Record>) -> Result<()> {
        let count = batch.len();
        for record in batch {
            info!(
                iface = %record.interface,
                direction = record.id.direction.as_str(),
                src = %record.id.src_addr,
                src_port = record.id.src_port,
                dst = %record.id.dst_addr,
                dst_port = record.id.dst_port,
                proto = record.id.transport_protocol,
                bytes = record.metrics.bytes,
                packets = record.metrics.packets,
                duplicate = record.duplicate,
                "flow"
            );
        }
        self.metrics.exported_records_total.inc_by(count as f64);
        self.metrics.exported_batches_total.inc();
        Ok(())
    }
}

/// Test doubles, also used by the integration tests.
pub mod testing {
    use super::*;
    use std::sync::mpsc;

    /// Forwards every batch to a channel so tests can inspect it.
    pub struct ChannelSink {
        tx: mpsc::Sender<Vec<Record>>,
    }

    impl ChannelSink {
        pub fn new() -> (Self, mpsc::Receiver<Vec<Record>>) {
            let (tx, rx) = mpsc::channel();
            (Self { tx }, rx)
        }
    }

    impl Sink for ChannelSink {
        fn name(&self) -> &str {
            "channel"
        }

        fn export(&mut self, batch: Vec<Record>) -> Result<()> {
            self.tx.send(batch)?;
            Ok(())
        }
    }
}
