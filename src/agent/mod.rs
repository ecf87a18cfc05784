//! Pipeline orchestration and agent lifecycle.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DedupMode};
use crate::ebpf::FlowFetcher;
use crate::export::{LogSink, Sink};
use crate::flow::{account, decorate, dedup, limiter, tracer_map, tracer_ringbuf, Record};
use crate::ifaces::{netlink, Event, Informer, Interface, InterfaceFilter, InterfaceNamer};
use crate::metrics::Metrics;

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl Status {
    fn can_become(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::NotStarted, Status::Starting)
                | (Status::Starting, Status::Started)
                | (Status::Started, Status::Stopping)
                | (Status::Stopping, Status::Stopped)
        )
    }
}

/// Agent owns the capture pipeline: kernel fetcher, interface
/// discovery, the processing stages and the sink.
pub struct Agent {
    cfg: Config,
    status: Status,
    metrics: Arc<Metrics>,
    fetcher: Arc<dyn FlowFetcher>,
    sink: Option<Box<dyn Sink>>,
    namer: Arc<InterfaceNamer>,
    cancel: CancellationToken,
    /// Stage handles in drain order, awaited during stop.
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Creates an agent backed by the kernel fetcher and the log sink.
    #[cfg(feature = "bpf")]
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics =
            Arc::new(Metrics::new(&cfg.metrics.addr).context("creating metrics registry")?);
        let fetcher = Arc::new(
            crate::ebpf::tracer::EbpfFetcher::new(&cfg).context("loading kernel programs")?,
        );
        let sink = Box::new(LogSink::new(Arc::clone(&metrics)));
        Ok(Self::assemble(cfg, metrics, fetcher, sink))
    }

    /// Creates an agent around caller-supplied fetcher and sink.
    pub fn with_fetcher(
        cfg: Config,
        fetcher: Arc<dyn FlowFetcher>,
        sink: Box<dyn Sink>,
    ) -> Result<Self> {
        let metrics =
            Arc::new(Metrics::new(&cfg.metrics.addr).context("creating metrics registry")?);
        Ok(Self::assemble(cfg, metrics, fetcher, sink))
    }

    fn assemble(
        cfg: Config,
        metrics: Arc<Metrics>,
        fetcher: Arc<dyn FlowFetcher>,
        sink: Box<dyn Sink>,
    ) -> Self {
        Self {
            cfg,
            status: Status::NotStarted,
            metrics,
            fetcher,
            sink: Some(sink),
            namer: Arc::new(InterfaceNamer::new()),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_become(next) {
            bail!("invalid status transition: {:?} -> {next:?}", self.status);
        }
        self.status = next;
        Ok(())
    }

    /// Start discovery, attach hooks as interfaces appear, and wire the
    /// processing stages together.
    pub async fn start(&mut self) -> Result<()> {
        self.transition(Status::Starting)?;

        self.metrics
            .start()
            .await
            .context("starting metrics server")?;

        let filter =
            InterfaceFilter::from_config(&self.cfg.interfaces).context("building filter")?;

        let events = Informer::from_config(&self.cfg.interfaces)
            .subscribe(self.cancel.child_token())
            .context("subscribing to interface events")?;

        let agent_ip = resolve_agent_ip(self.cfg.export.agent_ip.as_deref());
        match agent_ip {
            Some(ip) => info!(%ip, "agent IP resolved"),
            None => warn!("no agent IP available, records will carry none"),
        }

        self.spawn_discovery(events, filter);
        self.spawn_pipeline(agent_ip);
        if self.cfg.capture.enable_dns_tracking {
            self.spawn_dns_cleanup();
        }

        self.transition(Status::Started)?;
        info!("agent started");
        Ok(())
    }

    /// Stop everything: cancel, unblock the kernel reader, drain the
    /// stages in pipeline order, then bring the metrics server down.
    pub async fn stop(&mut self) -> Result<()> {
        self.transition(Status::Stopping)?;
        info!("agent stopping");

        self.cancel.cancel();

        // The map tracer runs one final scrape on cancellation; it must
        // finish before the kernel maps are released.
        if let Some(pos) = self.handles.iter().position(|(name, _)| *name == "map-tracer") {
            let (name, handle) = self.handles.remove(pos);
            if let Err(e) = handle.await {
                warn!(stage = name, error = %e, "stage task failed");
            }
        }

        // Unblocks the ring buffer reader and releases kernel hooks.
        let errs = self.fetcher.close();
        if !errs.is_empty() {
            warn!(count = errs.len(), errors = %errs, "kernel resource release reported errors");
        }

        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(stage = name, error = %e, "stage task failed");
            } else {
                debug!(stage = name, "stage drained");
            }
        }

        self.metrics
            .stop()
            .await
            .context("stopping metrics server")?;

        self.transition(Status::Stopped)?;
        info!("agent stopped");
        Ok(())
    }

    /// Consumes discovery events: updates the namer, applies the
    /// filter, and attaches the classifier. One interface failing to
    /// attach never stops the others.
    fn spawn_discovery(&mut self, mut events: mpsc::Receiver<Event>, filter: InterfaceFilter) {
        let fetcher = Arc::clone(&self.fetcher);
        let namer = Arc::clone(&self.namer);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut attached: HashSet<Interface> = HashSet::new();

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                match event {
                    Event::Added(iface) => {
                        namer.insert(iface.index, &iface.name);
                        if !filter.allowed(&iface) {
                            debug!(iface = %iface, "interface filtered out");
                            continue;
                        }
                        if attach(&*fetcher, &iface) && attached.insert(iface) {
                            metrics.interfaces_attached.set(attached.len() as f64);
                        }
                    }
                    Event::Removed(iface) => {
                        // The kernel detaches hooks of a removed device
                        // itself; only the bookkeeping needs updating.
                        if attached.remove(&iface) {
                            metrics.interfaces_attached.set(attached.len() as f64);
                        }
                    }
                }
            }
        });

        self.handles.push(("discovery", handle));
    }

    /// Wires tracers, accounter, optional deduper, limiter, decorator
    /// and the sink with bounded channels.
    fn spawn_pipeline(&mut self, agent_ip: Option<IpAddr>) {
        let buf = self.cfg.cache.buffers_length;

        let (acc_tx, acc_rx) = mpsc::channel::<Vec<Record>>(buf);
        let (post_acc_tx, mut stage_rx) = mpsc::channel::<Vec<Record>>(buf);

        let map_tracer = tracer_map::MapTracer::new(
            Arc::clone(&self.fetcher),
            self.cfg.cache.evict_period,
            Arc::clone(&self.metrics),
        );
        self.handles.push((
            "map-tracer",
            tokio::spawn(map_tracer.run(self.cancel.child_token(), acc_tx.clone())),
        ));

        let ring_tracer =
            tracer_ringbuf::RingBufTracer::new(Arc::clone(&self.fetcher), Arc::clone(&self.metrics));
        self.handles.push(("ringbuf-tracer", ring_tracer.spawn(acc_tx)));

        let accounter = account::Accounter::new(
            self.cfg.cache.max_flows,
            self.cfg.cache.active_timeout,
            Arc::clone(&self.metrics),
        );
        self.handles.push((
            "accounter",
            tokio::spawn(account::run(accounter, acc_rx, post_acc_tx)),
        ));

        if self.cfg.dedup.resolved_mode() == DedupMode::FirstCome {
            let deduper = dedup::Deduper::new(
                &self.cfg.dedup,
                Arc::clone(&self.namer),
                Arc::clone(&self.metrics),
            );
            let (tx, rx) = mpsc::channel::<Vec<Record>>(buf);
            self.handles
                .push(("deduper", tokio::spawn(dedup::run(deduper, stage_rx, tx))));
            stage_rx = rx;
        }

        let limiter =
            limiter::CapacityLimiter::new(&self.cfg.limiter, Arc::clone(&self.metrics));
        let (lim_tx, lim_rx) = mpsc::channel::<Vec<Record>>(buf);
        self.handles
            .push(("limiter", tokio::spawn(limiter::run(limiter, stage_rx, lim_tx))));

        let decorator = decorate::Decorator::new(agent_ip, Arc::clone(&self.namer));
        let (dec_tx, mut dec_rx) = mpsc::channel::<Vec<Record>>(buf);
        self.handles.push((
            "decorator",
            tokio::spawn(decorate::run(decorator, lim_rx, dec_tx)),
        ));

        let mut sink = self.sink.take().expect("sink consumed twice");
        let export = tokio::spawn(async move {
            while let Some(batch) = dec_rx.recv().await {
                if let Err(e) = sink.export(batch) {
                    warn!(sink = sink.name(), error = %e, "export failed, dropping batch");
                }
            }
        });
        self.handles.push(("export", export));
    }

    /// Periodic sweep of stale kernel DNS correlation entries.
    fn spawn_dns_cleanup(&mut self) {
        let fetcher = Arc::clone(&self.fetcher);
        let cancel = self.cancel.clone();
        let period = self.cfg.dns.cleanup_period;
        let timeout = self.cfg.dns.entry_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let fetcher = Arc::clone(&fetcher);
                        let _ = tokio::task::spawn_blocking(move || {
                            fetcher.delete_stale_dns_entries(timeout);
                        })
                        .await;
                    }
                }
            }
        });

        self.handles.push(("dns-cleanup", handle));
    }
}

/// Attach the classifier to one interface, falling back from TCX to
/// the legacy qdisc path. Returns whether any attach succeeded.
fn attach(fetcher: &dyn FlowFetcher, iface: &Interface) -> bool {
    match fetcher.attach_tcx(iface) {
        Ok(()) => {
            info!(iface = %iface, "classifier attached (tcx)");
            return true;
        }
        Err(e) => {
            warn!(iface = %iface, error = %e, "tcx attach failed, trying legacy path");
        }
    }
    match fetcher.register(iface) {
        Ok(()) => {
            info!(iface = %iface, "classifier attached (legacy)");
            true
        }
        Err(e) => {
            warn!(iface = %iface, error = %e, "interface could not be instrumented");
            false
        }
    }
}

/// The IP stamped on exported records: the configured override when
/// set, else the first global unicast address on the host.
fn resolve_agent_ip(configured: Option<&str>) -> Option<IpAddr> {
    if let Some(raw) = configured {
        // Config validation already parsed this.
        return raw.parse().ok();
    }

    match netlink::addr_dump() {
        Ok(addrs) => first_global_unicast(&addrs),
        Err(e) => {
            warn!(error = %e, "address dump failed while resolving agent IP");
            None
        }
    }
}

fn first_global_unicast(addrs: &[(u32, IpAddr)]) -> Option<IpAddr> {
    addrs
        .iter()
        .map(|(_, ip)| *ip)
        .find(|ip| is_global_unicast(*ip))
}

fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_link_local() && !v4.is_multicast() && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !v6.is_loopback() && !link_local && !v6.is_multicast() && !v6.is_unspecified()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::fake::FakeFetcher;
    use crate::export::testing::ChannelSink;

    fn agent() -> Agent {
        let cfg = Config {
            metrics: crate::config::MetricsConfig { addr: ":0".into() },
            ..Default::default()
        };
        let (sink, _rx) = ChannelSink::new();
        Agent::with_fetcher(cfg, Arc::new(FakeFetcher::new()), Box::new(sink))
            .expect("agent")
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::NotStarted.can_become(Status::Starting));
        assert!(Status::Starting.can_become(Status::Started));
        assert!(Status::Started.can_become(Status::Stopping));
        assert!(Status::Stopping.can_become(Status::Stopped));

        assert!(!Status::NotStarted.can_become(Status::Started));
        assert!(!Status::Stopped.can_become(Status::Starting));
        assert!(!Status::Started.can_become(Status::Starting));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let mut agent = agent();
        assert_eq!(agent.status(), Status::NotStarted);
        assert!(agent.stop().await.is_err());
        assert_eq!(agent.status(), Status::NotStarted);
    }

    #[test]
    fn test_is_global_unicast() {
        assert!(is_global_unicast("192.0.2.1".parse().unwrap()));
        assert!(is_global_unicast("2001:db8::1".parse().unwrap()));

        assert!(!is_global_unicast("127.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast("169.254.0.5".parse().unwrap()));
        assert!(!is_global_unicast("fe80::1".parse().unwrap()));
        assert!(!is_global_unicast("::1".parse().unwrap()));
        assert!(!is_global_unicast("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_first_global_unicast_skips_local_addresses() {
        let addrs: Vec<(u32, IpAddr)> = vec![
            (1, "127.0.0.1".parse().unwrap()),
            (2, "fe80::1".parse().unwrap()),
            (2, "198.51.100.9".parse().unwrap()),
            (3, "203.0.113.2".parse().unwrap()),
        ];
        assert_eq!(
            first_global_unicast(&addrs),
            Some("198.51.100.9".parse().unwrap())
        );
        assert_eq!(first_global_unicast(&[]), None);
    }

    #[test]
    fn test_configured_agent_ip_wins() {
        assert_eq!(
            resolve_agent_ip(Some("198.51.100.7")),
            Some("198.51.100.7".parse().unwrap())
        );
    }
}
