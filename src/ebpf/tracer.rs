//! aya-backed kernel fetcher.
//!
//! Loads the compiled classifier, attaches it per interface (TCX when
//! the kernel supports it, clsact filters otherwise) and gives the
//! tracers access to the flow maps and the ring buffer.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use aya::maps::{
    HashMap as BpfHashMap, Map, MapData, PerCpuArray, PerCpuHashMap, PerCpuValues, RingBuf,
};
use aya::programs::tc::{self, SchedClassifierLinkId, TcAttachOptions};
use aya::programs::{FEntry, KProbe, LinkOrder, SchedClassifier, TcAttachType, TracePoint};
use aya::{Btf, Ebpf, EbpfLoader};
use nix::sched::{setns, CloneFlags};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{FlowFetcher, GlobalCounter, ShutdownErrors};
use crate::config::Config;
use crate::flow::{
    decode_raw_record, monotonic_now, FlowId, FlowMetrics, RAW_FLOW_ID_SIZE,
    RAW_FLOW_METRICS_SIZE, RAW_RECORD_SIZE,
};
use crate::ifaces::{Interface, NetNs};
use crate::metrics::Metrics;

/// Compiled BPF object, embedded at build time.
///
/// `include_bytes_aligned!` guarantees the alignment aya's ELF parser
/// needs; plain `include_bytes!` only gives 1-byte alignment.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/flows.bpf.o"));

const TC_INGRESS_PROG: &str = "tc_ingress_flow_parse";
const TC_EGRESS_PROG: &str = "tc_egress_flow_parse";

const AGGREGATED_FLOWS_MAP: &str = "aggregated_flows";
const DIRECT_FLOWS_MAP: &str = "direct_flows";
const GLOBAL_COUNTERS_MAP: &str = "global_counters";
const DNS_FLOWS_MAP: &str = "dns_flows";

/// Key size of the kernel DNS correlation table. Matches
/// `struct dns_flow_id` in the classifier.
const DNS_KEY_SIZE: usize = 24;

/// Poll granularity of the blocking ring read, so close can unblock it.
const RING_POLL_MS: libc::c_int = 100;

/// How flow entries are pulled out of the kernel hashmap.
///
/// Atomic uses `BPF_MAP_LOOKUP_AND_DELETE_ELEM`; on kernels that do not
/// support it for per-CPU hashmaps the fetcher permanently switches to
/// reading then deleting, which leaves a bounded window where a flow
/// update between the two calls is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractionMode {
    Atomic,
    Legacy,
}

struct TcxLink {
    iface: Interface,
    program: &'static str,
    link: aya::programs::tc::SchedClassifierLink,
}

struct LegacyLink {
    iface: Interface,
    program: &'static str,
    attach_type: TcAttachType,
    link_id: SchedClassifierLinkId,
}

pub struct EbpfFetcher {
    ebpf: Mutex<Option<Ebpf>>,
    ring: Mutex<Option<RingBuf<MapData>>>,
    tcx_links: Mutex<Vec<TcxLink>>,
    legacy_links: Mutex<Vec<LegacyLink>>,
    mode: Mutex<ExtractionMode>,
    closed: AtomicBool,
    ncpus: usize,
    ingress: bool,
    egress: bool,
}

impl EbpfFetcher {
    /// Load the classifier and the optional instrumentation hooks.
    pub fn new(cfg: &Config) -> Result<Self> {
        let sampling = cfg.capture.sampling;
        let trace_dns: u8 = cfg.capture.enable_dns_tracking.into();
        let trace_rtt: u8 = cfg.capture.enable_rtt.into();

        // Kernels before 5.11 charge BPF maps against RLIMIT_MEMLOCK.
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            debug!("failed to remove memlock limit");
        }

        let mut loader = EbpfLoader::new();
        loader
            .set_global("sampling_rate", &sampling, true)
            .set_global("trace_dns", &trace_dns, true)
            .set_global("trace_rtt", &trace_rtt, true)
            .set_max_entries(AGGREGATED_FLOWS_MAP, cfg.cache.max_flows as u32);

        let mut ebpf = loader.load(BPF_OBJ).context("loading BPF objects")?;

        for name in [TC_INGRESS_PROG, TC_EGRESS_PROG] {
            let prog: &mut SchedClassifier = ebpf
                .program_mut(name)
                .ok_or_else(|| anyhow!("classifier program '{name}' not found"))?
                .try_into()
                .with_context(|| format!("'{name}' is not a classifier program"))?;
            prog.load()
                .with_context(|| format!("loading classifier {name}"))?;
        }

        if cfg.capture.enable_pkt_drops {
            attach_drop_tracker(&mut ebpf);
        }
        if cfg.capture.enable_rtt {
            attach_rtt_tracker(&mut ebpf)?;
        }

        let ring = RingBuf::try_from(
            ebpf.take_map(DIRECT_FLOWS_MAP)
                .ok_or_else(|| anyhow!("{DIRECT_FLOWS_MAP} map not found"))?,
        )
        .context("creating ring buffer")?;

        let ncpus = aya::util::nr_cpus()
            .map_err(|e| anyhow!("reading possible cpu count: {e:?}"))?;

        let direction = cfg.capture.resolved_direction();

        Ok(Self {
            ebpf: Mutex::new(Some(ebpf)),
            ring: Mutex::new(Some(ring)),
            tcx_links: Mutex::new(Vec::new()),
            legacy_links: Mutex::new(Vec::new()),
            mode: Mutex::new(ExtractionMode::Atomic),
            closed: AtomicBool::new(false),
            ncpus,
            ingress: direction.ingress(),
            egress: direction.egress(),
        })
    }

    fn directions(&self) -> Vec<(TcAttachType, &'static str)> {
        let mut dirs = Vec::with_capacity(2);
        if self.ingress {
            dirs.push((TcAttachType::Ingress, TC_INGRESS_PROG));
        }
        if self.egress {
            dirs.push((TcAttachType::Egress, TC_EGRESS_PROG));
        }
        dirs
    }
}

impl FlowFetcher for EbpfFetcher {
    fn attach_tcx(&self, iface: &Interface) -> Result<()> {
        let _guard = NetNsGuard::enter(iface.netns)?;

        let mut ebpf_guard = self.ebpf.lock();
        let ebpf = ebpf_guard.as_mut().ok_or_else(|| anyhow!("fetcher closed"))?;

        for (_, prog_name) in self.directions() {
            let prog: &mut SchedClassifier = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| anyhow!("classifier program '{prog_name}' not found"))?
                .try_into()?;

            let options = TcAttachOptions::TcxOrder(LinkOrder::default());
            let link_id = match prog.attach_with_options(&iface.name, options) {
                Ok(id) => id,
                Err(e) if errno_in_chain(&e, libc::EEXIST) => {
                    // A previous run already holds a TCX link here.
                    debug!(iface = %iface, program = prog_name, "tcx link already present");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("tcx attach of {prog_name} to {iface}")
                    });
                }
            };

            // An owned link survives program handle reborrows and is
            // detached explicitly at close.
            let link = prog
                .take_link(link_id)
                .with_context(|| format!("taking tcx link of {prog_name} on {iface}"))?;
            self.tcx_links.lock().push(TcxLink {
                iface: iface.clone(),
                program: prog_name,
                link,
            });
        }

        Ok(())
    }

    fn register(&self, iface: &Interface) -> Result<()> {
        let _guard = NetNsGuard::enter(iface.netns)?;

        if let Err(e) = tc::qdisc_add_clsact(&iface.name) {
            if e.raw_os_error() == Some(libc::EEXIST) {
                warn!(iface = %iface, "clsact qdisc already present, reusing");
            } else {
                return Err(e).with_context(|| format!("adding clsact qdisc to {iface}"));
            }
        }

        let mut ebpf_guard = self.ebpf.lock();
        let ebpf = ebpf_guard.as_mut().ok_or_else(|| anyhow!("fetcher closed"))?;

        for (attach_type, prog_name) in self.directions() {
            // An unclean shutdown leaves filters behind; aya removes
            // them by program name.
            if let Err(e) = tc::qdisc_detach_program(&iface.name, attach_type, prog_name) {
                debug!(iface = %iface, program = prog_name, error = %e, "no stale filter to remove");
            }

            let prog: &mut SchedClassifier = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| anyhow!("classifier program '{prog_name}' not found"))?
                .try_into()?;

            let link_id = prog
                .attach(&iface.name, attach_type)
                .with_context(|| format!("attaching {prog_name} filter to {iface}"))?;

            self.legacy_links.lock().push(LegacyLink {
                iface: iface.clone(),
                program: prog_name,
                attach_type,
                link_id,
            });
        }

        Ok(())
    }

    fn lookup_and_delete(&self, metrics: &Metrics) -> HashMap<FlowId, Vec<FlowMetrics>> {
        let mut out = HashMap::new();

        let mut ebpf_guard = self.ebpf.lock();
        let Some(ebpf) = ebpf_guard.as_mut() else {
            return out;
        };

        let map_fd = match ebpf.map(AGGREGATED_FLOWS_MAP) {
            Some(Map::PerCpuHashMap(data)) => data.fd().as_fd().as_raw_fd(),
            _ => {
                warn!(map = AGGREGATED_FLOWS_MAP, "flow map unavailable");
                return out;
            }
        };

        let Some(map) = ebpf.map_mut(AGGREGATED_FLOWS_MAP) else {
            return out;
        };
        let mut map: PerCpuHashMap<_, [u8; RAW_FLOW_ID_SIZE], [u8; RAW_FLOW_METRICS_SIZE]> =
            match PerCpuHashMap::try_from(map) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "flow map has an unexpected shape");
                    return out;
                }
            };

        // Phase 1: snapshot the keys, so deletion does not disturb
        // iteration.
        let keys: Vec<[u8; RAW_FLOW_ID_SIZE]> = map.keys().filter_map(|k| k.ok()).collect();

        for key in keys {
            let values = if *self.mode.lock() == ExtractionMode::Atomic {
                match per_cpu_lookup_and_delete(map_fd, &key, self.ncpus) {
                    Ok(values) => values,
                    Err(e)
                        if e.raw_os_error() == Some(libc::EOPNOTSUPP)
                            || e.raw_os_error() == Some(libc::EINVAL) =>
                    {
                        warn!(
                            "kernel lacks atomic per-cpu map extraction, switching to legacy reads"
                        );
                        *self.mode.lock() = ExtractionMode::Legacy;
                        match read_then_delete(&mut map, &key) {
                            Some(values) => values,
                            None => {
                                metrics.lookup_delete_errors_total.inc();
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        metrics.lookup_delete_errors_total.inc();
                        debug!(error = %e, "flow entry extraction failed");
                        continue;
                    }
                }
            } else {
                match read_then_delete(&mut map, &key) {
                    Some(values) => values,
                    None => {
                        metrics.lookup_delete_errors_total.inc();
                        continue;
                    }
                }
            };

            let mut per_cpu = Vec::with_capacity(values.len());
            let mut id = None;
            for value in &values {
                let mut raw = [0u8; RAW_RECORD_SIZE];
                raw[..RAW_FLOW_ID_SIZE].copy_from_slice(&key);
                raw[RAW_FLOW_ID_SIZE..].copy_from_slice(value);
                match decode_raw_record(&raw) {
                    Ok((decoded_id, decoded_metrics)) => {
                        id = Some(decoded_id);
                        per_cpu.push(decoded_metrics);
                    }
                    Err(e) => {
                        metrics.decode_errors_total.inc();
                        debug!(error = %e, "undecodable flow map entry");
                    }
                }
            }
            if let Some(id) = id {
                out.insert(id, per_cpu);
            }
        }

        out
    }

    fn read_global_counters(&self, metrics: &Metrics) {
        let mut ebpf_guard = self.ebpf.lock();
        let Some(ebpf) = ebpf_guard.as_mut() else {
            return;
        };
        let Some(map) = ebpf.map_mut(GLOBAL_COUNTERS_MAP) else {
            warn!(map = GLOBAL_COUNTERS_MAP, "counters map unavailable");
            return;
        };
        let mut counters: PerCpuArray<_, u64> = match PerCpuArray::try_from(map) {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "counters map has an unexpected shape");
                return;
            }
        };

        for counter in GlobalCounter::ALL {
            let key = counter.key();
            let total: u64 = match counters.get(&key, 0) {
                Ok(values) => values.iter().sum(),
                Err(e) => {
                    debug!(counter = ?counter, error = %e, "counter read failed");
                    continue;
                }
            };

            counter.observe(metrics, total);

            // Reset after read so each scrape publishes a delta.
            let zeros = match PerCpuValues::try_from(vec![0u64; self.ncpus]) {
                Ok(zeros) => zeros,
                Err(e) => {
                    warn!(error = %e, "building counter reset buffer");
                    return;
                }
            };
            if let Err(e) = counters.set(key, zeros, 0) {
                debug!(counter = ?counter, error = %e, "counter reset failed");
            }
        }
    }

    fn delete_stale_dns_entries(&self, timeout: Duration) {
        let mut ebpf_guard = self.ebpf.lock();
        let Some(ebpf) = ebpf_guard.as_mut() else {
            return;
        };
        let Some(map) = ebpf.map_mut(DNS_FLOWS_MAP) else {
            return;
        };
        let mut dns: BpfHashMap<_, [u8; DNS_KEY_SIZE], u64> = match BpfHashMap::try_from(map) {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "dns map has an unexpected shape");
                return;
            }
        };

        let now = monotonic_now().as_nanos() as u64;
        let timeout_ns = timeout.as_nanos() as u64;

        // Full scan first, deletions after, so the iterator never sees
        // its own removals.
        let stale: Vec<[u8; DNS_KEY_SIZE]> = dns
            .iter()
            .filter_map(|entry| entry.ok())
            .filter(|(_, ts)| now.saturating_sub(*ts) > timeout_ns)
            .map(|(key, _)| key)
            .collect();

        let count = stale.len();
        for key in stale {
            if let Err(e) = dns.remove(&key) {
                debug!(error = %e, "stale dns entry removal failed");
            }
        }
        if count > 0 {
            debug!(count, "removed stale dns entries");
        }
    }

    fn read_ring_buf(&self) -> Result<Vec<u8>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                bail!("ring buffer closed");
            }

            let fd = {
                let mut guard = self.ring.lock();
                let Some(ring) = guard.as_mut() else {
                    bail!("ring buffer closed");
                };
                if let Some(item) = ring.next() {
                    return Ok(item.to_vec());
                }
                ring.as_raw_fd()
            };

            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, RING_POLL_MS) };
            if rc < 0 {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("polling ring buffer");
            }
        }
    }

    fn close(&self) -> ShutdownErrors {
        let mut errs = ShutdownErrors::new();

        // Unblocks the reader on its next poll round.
        self.closed.store(true, Ordering::Release);
        self.ring.lock().take();

        // Owned TCX links detach on drop; surface the explicit result.
        for tcx in self.tcx_links.lock().drain(..) {
            if let Err(e) = tcx.link.detach() {
                if errno_in_chain(&e, libc::ENODEV) {
                    // The device is already gone, nothing to release.
                    continue;
                }
                errs.push(anyhow!(e).context(format!(
                    "detaching tcx link of {} from {}",
                    tcx.program, tcx.iface
                )));
            }
        }

        // Legacy filters need the program handle to detach.
        {
            let mut ebpf_guard = self.ebpf.lock();
            if let Some(ebpf) = ebpf_guard.as_mut() {
                for legacy in self.legacy_links.lock().drain(..) {
                    let prog: Result<&mut SchedClassifier> = ebpf
                        .program_mut(legacy.program)
                        .ok_or_else(|| anyhow!("classifier program '{}' missing", legacy.program))
                        .and_then(|p| p.try_into().map_err(anyhow::Error::from));
                    let prog = match prog {
                        Ok(prog) => prog,
                        Err(e) => {
                            errs.push(e);
                            continue;
                        }
                    };
                    if let Err(e) = prog.detach(legacy.link_id) {
                        if errno_in_chain(&e, libc::ENODEV) {
                            continue;
                        }
                        errs.push(anyhow!(e).context(format!(
                            "detaching {:?} filter of {} from {}",
                            legacy.attach_type, legacy.program, legacy.iface
                        )));
                    }
                }
            }
        }

        // Dropping the BPF objects unloads the programs, the optional
        // hooks and the maps. The clsact qdiscs stay; a later run warns
        // and reuses them.
        self.ebpf.lock().take();

        errs
    }
}

/// Collect-then-delete extraction for kernels without atomic per-CPU
/// lookup-and-delete. A flow update landing between the two calls is
/// lost; the window is a single map operation wide.
fn read_then_delete<T: std::borrow::BorrowMut<MapData>>(
    map: &mut PerCpuHashMap<T, [u8; RAW_FLOW_ID_SIZE], [u8; RAW_FLOW_METRICS_SIZE]>,
    key: &[u8; RAW_FLOW_ID_SIZE],
) -> Option<Vec<[u8; RAW_FLOW_METRICS_SIZE]>> {
    let values = match map.get(key, 0) {
        Ok(values) => values,
        Err(e) => {
            debug!(error = %e, "flow entry read failed");
            return None;
        }
    };
    let collected: Vec<[u8; RAW_FLOW_METRICS_SIZE]> = values.iter().copied().collect();
    if let Err(e) = map.remove(key) {
        debug!(error = %e, "flow entry delete failed");
    }
    Some(collected)
}

/// Layout of the map-element commands of the bpf(2) syscall.
#[repr(C)]
struct BpfMapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

const BPF_MAP_LOOKUP_AND_DELETE_ELEM: libc::c_long = 21;

/// Atomic per-key extraction. aya has no wrapper for this command on
/// per-CPU hashmaps, so it goes through the raw syscall.
fn per_cpu_lookup_and_delete(
    fd: RawFd,
    key: &[u8; RAW_FLOW_ID_SIZE],
    ncpus: usize,
) -> std::io::Result<Vec<[u8; RAW_FLOW_METRICS_SIZE]>> {
    let mut buf = vec![0u8; ncpus * RAW_FLOW_METRICS_SIZE];
    let mut attr = BpfMapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: buf.as_mut_ptr() as u64,
        flags: 0,
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_LOOKUP_AND_DELETE_ELEM,
            &mut attr as *mut BpfMapElemAttr as *mut libc::c_void,
            std::mem::size_of::<BpfMapElemAttr>() as u32,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(buf
        .chunks_exact(RAW_FLOW_METRICS_SIZE)
        .map(|chunk| {
            let mut value = [0u8; RAW_FLOW_METRICS_SIZE];
            value.copy_from_slice(chunk);
            value
        })
        .collect())
}

/// Attach the packet-drop tracepoint. Missing kernel support degrades
/// to flows without drop accounting, logged once.
fn attach_drop_tracker(ebpf: &mut Ebpf) {
    let result: Result<()> = (|| {
        let prog: &mut TracePoint = ebpf
            .program_mut("tp_kfree_skb")
            .ok_or_else(|| anyhow!("tp_kfree_skb program not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach("skb", "kfree_skb")?;
        Ok(())
    })();

    match result {
        Ok(()) => info!("packet drop tracking enabled"),
        Err(e) => warn!(error = %e, "packet drop tracking unavailable"),
    }
}

/// Attach the RTT estimator: fentry fast path, kprobe fallback.
/// Construction fails only when both are unavailable.
fn attach_rtt_tracker(ebpf: &mut Ebpf) -> Result<()> {
    let fentry_result: Result<()> = (|| {
        let btf = Btf::from_sys_fs().context("reading kernel BTF")?;
        let prog: &mut FEntry = ebpf
            .program_mut("fentry_tcp_rcv_established")
            .ok_or_else(|| anyhow!("fentry_tcp_rcv_established program not found"))?
            .try_into()?;
        prog.load("tcp_rcv_established", &btf)?;
        prog.attach()?;
        Ok(())
    })();

    match fentry_result {
        Ok(()) => {
            info!("rtt tracking enabled (fentry)");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "fentry rtt hook unavailable, falling back to kprobe");
        }
    }

    let prog: &mut KProbe = ebpf
        .program_mut("kp_tcp_rcv_established")
        .ok_or_else(|| anyhow!("kp_tcp_rcv_established program not found"))?
        .try_into()?;
    prog.load().context("loading rtt kprobe")?;
    prog.attach("tcp_rcv_established", 0)
        .context("attaching rtt kprobe")?;

    info!("rtt tracking enabled (kprobe)");
    Ok(())
}

/// Whether `errno` appears anywhere in the error's source chain.
fn errno_in_chain(err: &(dyn std::error::Error + 'static), errno: i32) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if io_err.raw_os_error() == Some(errno) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Scoped network namespace switch. Re-enters the previous namespace
/// on drop, error paths included. A no-op when the target is the
/// caller's own namespace.
struct NetNsGuard {
    prev: Option<File>,
}

impl NetNsGuard {
    fn enter(target: NetNs) -> Result<Self> {
        let Some(handle) = netns_handle(target)? else {
            return Ok(Self { prev: None });
        };

        let prev =
            File::open("/proc/self/ns/net").context("opening current network namespace")?;
        setns(handle.as_fd(), CloneFlags::CLONE_NEWNET)
            .with_context(|| format!("entering namespace {target}"))?;

        Ok(Self { prev: Some(prev) })
    }
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            if let Err(e) = setns(prev.as_fd(), CloneFlags::CLONE_NEWNET) {
                // Leaves the thread in the wrong namespace; later
                // attaches on it would target the wrong devices.
                tracing::error!(error = %e, "restoring network namespace failed");
            }
        }
    }
}

/// Find a handle for a foreign namespace under `/var/run/netns`.
/// Returns `None` when the target is the current namespace.
fn netns_handle(target: NetNs) -> Result<Option<File>> {
    if target == NetNs::current() {
        return Ok(None);
    }
    let Some(target_ino) = target.0 else {
        return Ok(None);
    };

    let entries = std::fs::read_dir("/var/run/netns")
        .with_context(|| format!("no handle for namespace {target}"))?;
    for entry in entries {
        let path = entry.context("reading /var/run/netns")?.path();
        let ino = std::fs::metadata(&path)
            .with_context(|| format!("inspecting {}", path.display()))?
            .ino();
        if ino == target_ino {
            let file = File::open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            return Ok(Some(file));
        }
    }

    bail!("namespace {target} has no handle under /var/run/netns")
}
