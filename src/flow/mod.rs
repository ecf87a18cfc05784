//! Flow record types and the raw kernel record codec.
//!
//! The kernel classifier publishes fixed-layout little-endian records,
//! either as values of the aggregated-flow map or as single samples on
//! the overflow ring buffer. Both channels decode into the same
//! [`FlowId`] / [`FlowMetrics`] pair.

pub mod account;
pub mod decorate;
pub mod dedup;
pub mod limiter;
pub mod tracer_map;
pub mod tracer_ringbuf;

use std::net::{IpAddr, Ipv6Addr};
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Traffic direction relative to the instrumented interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Ingress = 0,
    Egress = 1,
}

impl Direction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ingress),
            1 => Some(Self::Egress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

/// Aggregation key for a flow, matching the kernel map key layout.
///
/// Two raw records with equal `FlowId` belong to the same flow and are
/// merged by the accounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub eth_protocol: u16,
    pub direction: Direction,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport_protocol: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Index of the interface the packet was observed on.
    pub if_index: u32,
}

/// DNS correlation sub-record attached to a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: u16,
    pub flags: u16,
    pub errno: u8,
    pub latency_ns: u64,
}

/// Mutable per-flow counters within one active window.
///
/// Timestamps are kernel monotonic nanoseconds; wall-clock times are
/// derived later by the accounter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowMetrics {
    pub bytes: u64,
    pub packets: u32,
    /// TCP flags OR-ed across the packets of the window.
    pub flags: u16,
    /// Kernel errno that caused a ring buffer fallback, 0 otherwise.
    pub errno: u8,
    pub dscp: u8,
    pub start_mono_ts: u64,
    pub end_mono_ts: u64,
    pub dns: DnsRecord,
    pub flow_rtt_ns: u64,
}

impl FlowMetrics {
    /// Merge a later observation of the same flow into this one.
    pub fn accumulate(&mut self, other: &FlowMetrics) {
        self.bytes += other.bytes;
        self.packets += other.packets;
        self.flags |= other.flags;

        // A zero start timestamp means the producer never saw the first
        // packet of the window; take whatever the other side has.
        if self.start_mono_ts == 0
            || (other.start_mono_ts != 0 && other.start_mono_ts < self.start_mono_ts)
        {
            self.start_mono_ts = other.start_mono_ts;
        }
        if other.end_mono_ts > self.end_mono_ts {
            self.end_mono_ts = other.end_mono_ts;
        }

        if self.errno == 0 {
            self.errno = other.errno;
        }
        if other.dscp != 0 {
            self.dscp = other.dscp;
        }
        if self.dns.id == 0 && other.dns.id != 0 {
            self.dns = other.dns;
        }
        if other.flow_rtt_ns > self.flow_rtt_ns {
            self.flow_rtt_ns = other.flow_rtt_ns;
        }
    }
}

/// One unit flowing through the pipeline: a flow identity plus a
/// metrics snapshot, decorated downstream of the accounter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: FlowId,
    pub metrics: FlowMetrics,
    /// Wall-clock window bounds, stamped by the accounter.
    pub time_flow_start: SystemTime,
    pub time_flow_end: SystemTime,
    pub agent_ip: Option<IpAddr>,
    /// Resolved interface name, stamped by the decorator.
    pub interface: String,
    pub duplicate: bool,
}

impl Record {
    /// Build an undecorated record from a decoded kernel entry.
    pub fn new(id: FlowId, metrics: FlowMetrics) -> Self {
        Self {
            id,
            metrics,
            time_flow_start: SystemTime::UNIX_EPOCH,
            time_flow_end: SystemTime::UNIX_EPOCH,
            agent_ip: None,
            interface: String::new(),
            duplicate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw record codec
// ---------------------------------------------------------------------------

/// Size in bytes of a raw kernel record (map value or ring buffer
/// sample payload, both share the id+metrics layout).
pub const RAW_RECORD_SIZE: usize = 104;

/// Size of the flow id prefix within a raw record.
pub const RAW_FLOW_ID_SIZE: usize = 48;

/// Size of the metrics portion: the value type of the kernel hashmap.
pub const RAW_FLOW_METRICS_SIZE: usize = RAW_RECORD_SIZE - RAW_FLOW_ID_SIZE;

/// Errors decoding a raw kernel record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record too short: {size} bytes, need {need}")]
    Truncated { size: usize, need: usize },

    #[error("invalid direction byte {raw}")]
    InvalidDirection { raw: u8 },
}

/// Decode the flow id prefix of a raw record.
pub fn decode_flow_id(data: &[u8]) -> Result<FlowId, DecodeError> {
    if data.len() < RAW_FLOW_ID_SIZE {
        return Err(DecodeError::Truncated {
            size: data.len(),
            need: RAW_FLOW_ID_SIZE,
        });
    }

    let direction_raw = read_u8(data, 2);
    let direction =
        Direction::from_u8(direction_raw).ok_or(DecodeError::InvalidDirection { raw: direction_raw })?;

    Ok(FlowId {
        eth_protocol: read_u16_le(data, 0),
        direction,
        transport_protocol: read_u8(data, 3),
        src_addr: decode_ip(read_fixed::<16>(data, 4)),
        dst_addr: decode_ip(read_fixed::<16>(data, 20)),
        src_port: read_u16_le(data, 36),
        dst_port: read_u16_le(data, 38),
        icmp_type: read_u8(data, 40),
        icmp_code: read_u8(data, 41),
        if_index: read_u32_le(data, 44),
    })
}

/// Decode the metrics portion of a raw record (offsets relative to the
/// record start).
pub fn decode_flow_metrics(data: &[u8]) -> Result<FlowMetrics, DecodeError> {
    if data.len() < RAW_RECORD_SIZE {
        return Err(DecodeError::Truncated {
            size: data.len(),
            need: RAW_RECORD_SIZE,
        });
    }

    Ok(FlowMetrics {
        bytes: read_u64_le(data, 48),
        packets: read_u32_le(data, 56),
        flags: read_u16_le(data, 60),
        errno: read_u8(data, 62),
        dscp: read_u8(data, 63),
        start_mono_ts: read_u64_le(data, 64),
        end_mono_ts: read_u64_le(data, 72),
        dns: DnsRecord {
            id: read_u16_le(data, 80),
            flags: read_u16_le(data, 82),
            errno: read_u8(data, 84),
            latency_ns: read_u64_le(data, 88),
        },
        flow_rtt_ns: read_u64_le(data, 96),
    })
}

/// Decode a full raw record (ring buffer sample).
pub fn decode_raw_record(data: &[u8]) -> Result<(FlowId, FlowMetrics), DecodeError> {
    let id = decode_flow_id(data)?;
    let metrics = decode_flow_metrics(data)?;
    Ok((id, metrics))
}

/// Encode a record into the raw kernel layout. The inverse of
/// [`decode_raw_record`]; used by the fake fetcher and tests.
pub fn encode_raw_record(id: &FlowId, metrics: &FlowMetrics) -> [u8; RAW_RECORD_SIZE] {
    let mut buf = [0u8; RAW_RECORD_SIZE];

    buf[0..2].copy_from_slice(&id.eth_protocol.to_le_bytes());
    buf[2] = id.direction as u8;
    buf[3] = id.transport_protocol;
    buf[4..20].copy_from_slice(&encode_ip(id.src_addr));
    buf[20..36].copy_from_slice(&encode_ip(id.dst_addr));
    buf[36..38].copy_from_slice(&id.src_port.to_le_bytes());
    buf[38..40].copy_from_slice(&id.dst_port.to_le_bytes());
    buf[40] = id.icmp_type;
    buf[41] = id.icmp_code;
    buf[44..48].copy_from_slice(&id.if_index.to_le_bytes());

    buf[48..56].copy_from_slice(&metrics.bytes.to_le_bytes());
    buf[56..60].copy_from_slice(&metrics.packets.to_le_bytes());
    buf[60..62].copy_from_slice(&metrics.flags.to_le_bytes());
    buf[62] = metrics.errno;
    buf[63] = metrics.dscp;
    buf[64..72].copy_from_slice(&metrics.start_mono_ts.to_le_bytes());
    buf[72..80].copy_from_slice(&metrics.end_mono_ts.to_le_bytes());
    buf[80..82].copy_from_slice(&metrics.dns.id.to_le_bytes());
    buf[82..84].copy_from_slice(&metrics.dns.flags.to_le_bytes());
    buf[84] = metrics.dns.errno;
    buf[88..96].copy_from_slice(&metrics.dns.latency_ns.to_le_bytes());
    buf[96..104].copy_from_slice(&metrics.flow_rtt_ns.to_le_bytes());

    buf
}

/// The kernel stores all addresses as 16 bytes, IPv4 as v4-mapped v6.
fn decode_ip(raw: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(raw);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn encode_ip(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify record lengths before reading fixed offsets.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Current value of the kernel monotonic clock, the same clock the
/// classifier stamps records with.
pub fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: clock_gettime with a valid timespec pointer cannot fail
    // for CLOCK_MONOTONIC on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Wall-clock instant corresponding to monotonic zero (boot). Used to
/// convert kernel monotonic timestamps into wall-clock times.
pub fn boot_epoch() -> SystemTime {
    SystemTime::now() - monotonic_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_id() -> FlowId {
        FlowId {
            eth_protocol: 0x0800,
            direction: Direction::Egress,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 43210,
            dst_port: 443,
            transport_protocol: 6,
            icmp_type: 0,
            icmp_code: 0,
            if_index: 3,
        }
    }

    #[test]
    fn test_raw_record_roundtrip() {
        let id = sample_id();
        let metrics = FlowMetrics {
            bytes: 1234,
            packets: 7,
            flags: 0x12,
            errno: 0,
            dscp: 46,
            start_mono_ts: 1_000_000,
            end_mono_ts: 2_000_000,
            dns: DnsRecord {
                id: 0x3344,
                flags: 0x8180,
                errno: 0,
                latency_ns: 550_000,
            },
            flow_rtt_ns: 80_000,
        };

        let buf = encode_raw_record(&id, &metrics);
        let (got_id, got_metrics) = decode_raw_record(&buf).expect("decode");
        assert_eq!(got_id, id);
        assert_eq!(got_metrics, metrics);
    }

    #[test]
    fn test_decode_ipv6_address() {
        let mut id = sample_id();
        id.src_addr = IpAddr::V6("2001:db8::1".parse().unwrap());
        id.dst_addr = IpAddr::V6("2001:db8::2".parse().unwrap());

        let buf = encode_raw_record(&id, &FlowMetrics::default());
        let (got_id, _) = decode_raw_record(&buf).expect("decode");
        assert_eq!(got_id.src_addr, id.src_addr);
        assert_eq!(got_id.dst_addr, id.dst_addr);
    }

    #[test]
    fn test_decode_truncated_record() {
        let buf = [0u8; RAW_RECORD_SIZE - 1];
        assert!(matches!(
            decode_raw_record(&buf),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_direction() {
        let mut buf = encode_raw_record(&sample_id(), &FlowMetrics::default());
        buf[2] = 9;
        assert!(matches!(
            decode_raw_record(&buf),
            Err(DecodeError::InvalidDirection { raw: 9 })
        ));
    }

    #[test]
    fn test_accumulate_merges_counters() {
        let mut a = FlowMetrics {
            bytes: 10,
            packets: 1,
            flags: 0b0001,
            start_mono_ts: 200,
            end_mono_ts: 300,
            ..Default::default()
        };
        let b = FlowMetrics {
            bytes: 20,
            packets: 2,
            flags: 0b0100,
            start_mono_ts: 100,
            end_mono_ts: 500,
            flow_rtt_ns: 42,
            ..Default::default()
        };

        a.accumulate(&b);
        assert_eq!(a.bytes, 30);
        assert_eq!(a.packets, 3);
        assert_eq!(a.flags, 0b0101);
        assert_eq!(a.start_mono_ts, 100);
        assert_eq!(a.end_mono_ts, 500);
        assert_eq!(a.flow_rtt_ns, 42);
    }

    #[test]
    fn test_accumulate_zero_start_is_replaced() {
        let mut a = FlowMetrics {
            start_mono_ts: 0,
            end_mono_ts: 10,
            ..Default::default()
        };
        a.accumulate(&FlowMetrics {
            start_mono_ts: 5,
            end_mono_ts: 7,
            ..Default::default()
        });
        assert_eq!(a.start_mono_ts, 5);
        assert_eq!(a.end_mono_ts, 10);
    }
}
