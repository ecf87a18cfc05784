use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for the agent.
///
/// All metrics use the "flowmeter" namespace. One instance is shared by
/// every pipeline stage and the kernel fetcher.
pub struct Metrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Eviction rounds per source (map, ringbuffer, accounter).
    pub evictions_total: CounterVec,
    /// Flows evicted per source.
    pub evicted_flows_total: CounterVec,
    /// Kernel hashmap entries seen in the last scrape, per-CPU copies included.
    pub hashmap_entries: Gauge,
    /// Unique flow identities extracted in the last scrape.
    pub hashmap_unique_flows: Gauge,
    /// Per-key lookup-and-delete failures, entry skipped.
    pub lookup_delete_errors_total: Counter,
    /// Kernel-side dropped flows by reason, from the global counters table.
    pub kernel_flows_dropped_total: CounterVec,
    /// Kernel-side flow filter decisions, from the global counters table.
    pub kernel_filter_events_total: CounterVec,
    /// Packets dropped by the kernel stack, from the drop tracepoint.
    pub kernel_pkt_drops_total: Counter,
    /// New-key arrivals forwarded as singletons because the accounter was full.
    pub accounter_capacity_exceeded_total: Counter,
    /// Live entries in the accounter cache.
    pub accounter_entries: Gauge,
    /// Duplicate records dropped by the deduper.
    pub dedup_dropped_total: Counter,
    /// Duplicate records whose counters were merged into the canonical flow.
    pub dedup_merged_total: Counter,
    /// Records admitted by the capacity limiter.
    pub limiter_admitted_total: Counter,
    /// Records rejected by the capacity limiter.
    pub limiter_rejected_total: Counter,
    /// Raw records that failed to decode.
    pub decode_errors_total: Counter,
    /// Records handed to the sink.
    pub exported_records_total: Counter,
    /// Batches handed to the sink.
    pub exported_batches_total: Counter,
    /// Interfaces with live kernel hooks.
    pub interfaces_attached: Gauge,
}

impl Metrics {
    /// Creates a new metrics instance with all families registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let evictions_total = CounterVec::new(
            Opts::new("evictions_total", "Eviction rounds by source.").namespace("flowmeter"),
            &["source"],
        )?;
        let evicted_flows_total = CounterVec::new(
            Opts::new("evicted_flows_total", "Flows evicted by source.").namespace("flowmeter"),
            &["source"],
        )?;
        let hashmap_entries = Gauge::with_opts(
            Opts::new(
                "hashmap_entries",
                "Kernel hashmap entries seen in the last scrape (per-CPU copies included).",
            )
            .namespace("flowmeter"),
        )?;
        let hashmap_unique_flows = Gauge::with_opts(
            Opts::new(
                "hashmap_unique_flows",
                "Unique flow identities extracted in the last scrape.",
            )
            .namespace("flowmeter"),
        )?;
        let lookup_delete_errors_total = Counter::with_opts(
            Opts::new(
                "lookup_delete_errors_total",
                "Per-key kernel map extraction failures.",
            )
            .namespace("flowmeter"),
        )?;
        let kernel_flows_dropped_total = CounterVec::new(
            Opts::new(
                "kernel_flows_dropped_total",
                "Kernel-side dropped flows by reason.",
            )
            .namespace("flowmeter"),
            &["reason"],
        )?;
        let kernel_filter_events_total = CounterVec::new(
            Opts::new(
                "kernel_filter_events_total",
                "Kernel-side flow filter decisions.",
            )
            .namespace("flowmeter"),
            &["action"],
        )?;
        let kernel_pkt_drops_total = Counter::with_opts(
            Opts::new(
                "kernel_pkt_drops_total",
                "Packets dropped by the kernel stack.",
            )
            .namespace("flowmeter"),
        )?;
        let accounter_capacity_exceeded_total = Counter::with_opts(
            Opts::new(
                "accounter_capacity_exceeded_total",
                "New flows forwarded as singletons because the cache was full.",
            )
            .namespace("flowmeter"),
        )?;
        let accounter_entries = Gauge::with_opts(
            Opts::new("accounter_entries", "Live entries in the accounter cache.")
                .namespace("flowmeter"),
        )?;
        let dedup_dropped_total = Counter::with_opts(
            Opts::new(
                "dedup_dropped_total",
                "Duplicate records dropped by the deduper.",
            )
            .namespace("flowmeter"),
        )?;
        let dedup_merged_total = Counter::with_opts(
            Opts::new(
                "dedup_merged_total",
                "Duplicate records merged into their canonical flow.",
            )
            .namespace("flowmeter"),
        )?;
        let limiter_admitted_total = Counter::with_opts(
            Opts::new(
                "limiter_admitted_total",
                "Records admitted by the capacity limiter.",
            )
            .namespace("flowmeter"),
        )?;
        let limiter_rejected_total = Counter::with_opts(
            Opts::new(
                "limiter_rejected_total",
                "Records rejected by the capacity limiter.",
            )
            .namespace("flowmeter"),
        )?;
        let decode_errors_total = Counter::with_opts(
            Opts::new("decode_errors_total", "Raw records that failed to decode.")
                .namespace("flowmeter"),
        )?;
        let exported_records_total = Counter::with_opts(
            Opts::new("exported_records_total", "Records handed to the sink.")
                .namespace("flowmeter"),
        )?;
        let exported_batches_total = Counter::with_opts(
            Opts::new("exported_batches_total", "Batches handed to the sink.")
                .namespace("flowmeter"),
        )?;
        let interfaces_attached = Gauge::with_opts(
            Opts::new(
                "interfaces_attached",
                "Interfaces with live kernel hooks.",
            )
            .namespace("flowmeter"),
        )?;

        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(evicted_flows_total.clone()))?;
        registry.register(Box::new(hashmap_entries.clone()))?;
        registry.register(Box::new(hashmap_unique_flows.clone()))?;
        registry.register(Box::new(lookup_delete_errors_total.clone()))?;
        registry.register(Box::new(kernel_flows_dropped_total.clone()))?;
        registry.register(Box::new(kernel_filter_events_total.clone()))?;
        registry.register(Box::new(kernel_pkt_drops_total.clone()))?;
        registry.register(Box::new(accounter_capacity_exceeded_total.clone()))?;
        registry.register(Box::new(accounter_entries.clone()))?;
        registry.register(Box::new(dedup_dropped_total.clone()))?;
        registry.register(Box::new(dedup_merged_total.clone()))?;
        registry.register(Box::new(limiter_admitted_total.clone()))?;
        registry.register(Box::new(limiter_rejected_total.clone()))?;
        registry.register(Box::new(decode_errors_total.clone()))?;
        registry.register(Box::new(exported_records_total.clone()))?;
        registry.register(Box::new(exported_batches_total.clone()))?;
        registry.register(Box::new(interfaces_attached.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            evictions_total,
            evicted_flows_total,
            hashmap_entries,
            hashmap_unique_flows,
            lookup_delete_errors_total,
            kernel_flows_dropped_total,
            kernel_filter_events_total,
            kernel_pkt_drops_total,
            accounter_capacity_exceeded_total,
            accounter_entries,
            dedup_dropped_total,
            dedup_merged_total,
            limiter_admitted_total,
            limiter_rejected_total,
            decode_errors_total,
            exported_records_total,
            exported_batches_total,
            interfaces_attached,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
