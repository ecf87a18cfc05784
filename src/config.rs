use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Top-level configuration for the flowmeter agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Interface discovery and filtering configuration.
    #[serde(default)]
    pub interfaces: InterfacesConfig,

    /// Kernel capture configuration.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Aggregation cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// DNS correlation table cleanup configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Cross-interface deduplication configuration.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Export admission control configuration.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Export configuration.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

/// Interface discovery and filtering configuration.
#[derive(Debug, Deserialize)]
pub struct InterfacesConfig {
    /// Interface name patterns to instrument (anchored regexes).
    /// Empty means all interfaces not excluded.
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Interface name patterns to skip. Exclusion wins. Default: ["lo"].
    #[serde(default = "default_exclude_interfaces")]
    pub exclude_interfaces: Vec<String>,

    /// Instrument only interfaces hosting one of these addresses.
    /// Mutually exclusive with the name-based options above.
    #[serde(default)]
    pub interface_ips: Vec<String>,

    /// Discovery strategy: "watch" (netlink subscription) or "poll".
    /// Default: "watch"; invalid values fall back to "watch".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Enumeration period when listen = "poll". Default: 10s.
    #[serde(default = "default_listen_poll_period", with = "humantime_serde")]
    pub listen_poll_period: Duration,
}

/// Kernel capture configuration.
#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// Traffic direction to capture: "ingress", "egress" or "both".
    /// Default: "both"; invalid values fall back to "both".
    #[serde(default = "default_direction")]
    pub direction: String,

    /// Capture 1 out of `sampling` packets. Default: 1 (all packets).
    #[serde(default = "default_sampling")]
    pub sampling: u32,

    /// Enable DNS query/response correlation. Default: false.
    #[serde(default)]
    pub enable_dns_tracking: bool,

    /// Enable TCP RTT estimation. Default: false.
    #[serde(default)]
    pub enable_rtt: bool,

    /// Enable packet-drop tracking. Default: false.
    #[serde(default)]
    pub enable_pkt_drops: bool,
}

/// Aggregation cache configuration.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Maximum flows held in the accounter cache. Default: 5000.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Active window before an aggregated flow is flushed. Default: 5s.
    #[serde(default = "default_active_timeout", with = "humantime_serde")]
    pub active_timeout: Duration,

    /// Kernel hashmap scrape period. Default: 5s.
    #[serde(default = "default_evict_period", with = "humantime_serde")]
    pub evict_period: Duration,

    /// Capacity of the channels between pipeline stages. Default: 50.
    #[serde(default = "default_buffers_length")]
    pub buffers_length: usize,
}

/// DNS correlation table cleanup configuration.
#[derive(Debug, Deserialize)]
pub struct DnsConfig {
    /// How often to sweep the kernel DNS table. Default: 1m.
    #[serde(default = "default_dns_cleanup_period", with = "humantime_serde")]
    pub cleanup_period: Duration,

    /// Age after which an unanswered DNS entry is removed. Default: 10s.
    #[serde(default = "default_dns_entry_timeout", with = "humantime_serde")]
    pub entry_timeout: Duration,
}

/// Cross-interface deduplication configuration.
#[derive(Debug, Deserialize)]
pub struct DedupConfig {
    /// "none" or "first_come". Default: "none"; invalid values fall
    /// back to "none".
    #[serde(default = "default_dedup_mode")]
    pub mode: String,

    /// Mark duplicates instead of dropping them. Default: false.
    #[serde(default)]
    pub just_mark: bool,

    /// Merge dropped duplicates' counters into the canonical flow.
    /// Default: false.
    #[serde(default)]
    pub merge: bool,

    /// How long a canonical interface claim lives without traffic.
    /// Default: 10s.
    #[serde(default = "default_dedup_expiry", with = "humantime_serde")]
    pub expiry: Duration,
}

/// Export admission control configuration.
#[derive(Debug, Deserialize)]
pub struct LimiterConfig {
    /// Records admitted per interval; the rest are dropped and counted.
    /// Default: 10000.
    #[serde(default = "default_limiter_max_records")]
    pub max_records: usize,

    /// Admission accounting interval. Default: 1s.
    #[serde(default = "default_limiter_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Export configuration.
#[derive(Debug, Deserialize)]
pub struct ExportConfig {
    /// Export target. Only "log" ships with the agent. Default: "log".
    #[serde(default = "default_export_target")]
    pub target: String,

    /// Agent IP stamped on records. When unset, the first global
    /// unicast address found on a discovered interface is used.
    #[serde(default)]
    pub agent_ip: Option<String>,
}

/// Capture direction after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionConfig {
    Ingress,
    Egress,
    Both,
}

impl DirectionConfig {
    pub fn ingress(&self) -> bool {
        matches!(self, Self::Ingress | Self::Both)
    }

    pub fn egress(&self) -> bool {
        matches!(self, Self::Egress | Self::Both)
    }
}

/// Deduplication mode after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    None,
    FirstCome,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    ":9090".to_string()
}

fn default_exclude_interfaces() -> Vec<String> {
    vec!["lo".to_string()]
}

fn default_listen() -> String {
    "watch".to_string()
}

fn default_listen_poll_period() -> Duration {
    Duration::from_secs(10)
}

fn default_direction() -> String {
    "both".to_string()
}

fn default_sampling() -> u32 {
    1
}

fn default_max_flows() -> usize {
    5000
}

fn default_active_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_evict_period() -> Duration {
    Duration::from_secs(5)
}

fn default_buffers_length() -> usize {
    50
}

fn default_dns_cleanup_period() -> Duration {
    Duration::from_secs(60)
}

fn default_dns_entry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_dedup_mode() -> String {
    "none".to_string()
}

fn default_dedup_expiry() -> Duration {
    Duration::from_secs(10)
}

fn default_limiter_max_records() -> usize {
    10_000
}

fn default_limiter_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_export_target() -> String {
    "log".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
            interfaces: InterfacesConfig::default(),
            capture: CaptureConfig::default(),
            cache: CacheConfig::default(),
            dns: DnsConfig::default(),
            dedup: DedupConfig::default(),
            limiter: LimiterConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            exclude_interfaces: default_exclude_interfaces(),
            interface_ips: Vec::new(),
            listen: default_listen(),
            listen_poll_period: default_listen_poll_period(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            direction: default_direction(),
            sampling: default_sampling(),
            enable_dns_tracking: false,
            enable_rtt: false,
            enable_pkt_drops: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            active_timeout: default_active_timeout(),
            evict_period: default_evict_period(),
            buffers_length: default_buffers_length(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cleanup_period: default_dns_cleanup_period(),
            entry_timeout: default_dns_entry_timeout(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: default_dedup_mode(),
            just_mark: false,
            merge: false,
            expiry: default_dedup_expiry(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_records: default_limiter_max_records(),
            interval: default_limiter_interval(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            target: default_export_target(),
            agent_ip: None,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let has_names = !self.interfaces.interfaces.is_empty()
            || self.interfaces.exclude_interfaces != default_exclude_interfaces();
        if has_names && !self.interfaces.interface_ips.is_empty() {
            bail!("interfaces/exclude_interfaces and interface_ips are mutually exclusive");
        }

        if self.interfaces.listen_poll_period.is_zero() {
            bail!("interfaces.listen_poll_period must be positive");
        }

        if self.capture.sampling == 0 {
            bail!("capture.sampling must be at least 1");
        }

        if self.cache.max_flows == 0 {
            bail!("cache.max_flows must be positive");
        }
        if self.cache.active_timeout.is_zero() {
            bail!("cache.active_timeout must be positive");
        }
        if self.cache.evict_period.is_zero() {
            bail!("cache.evict_period must be positive");
        }
        if self.cache.buffers_length == 0 {
            bail!("cache.buffers_length must be positive");
        }

        if self.dns.cleanup_period.is_zero() {
            bail!("dns.cleanup_period must be positive");
        }
        if self.dns.entry_timeout.is_zero() {
            bail!("dns.entry_timeout must be positive");
        }

        if self.dedup.expiry.is_zero() {
            bail!("dedup.expiry must be positive");
        }

        if self.limiter.max_records == 0 {
            bail!("limiter.max_records must be positive");
        }
        if self.limiter.interval.is_zero() {
            bail!("limiter.interval must be positive");
        }

        if self.export.target != "log" {
            bail!("unknown export target: {}", self.export.target);
        }

        if let Some(ip) = &self.export.agent_ip {
            ip.parse::<std::net::IpAddr>()
                .with_context(|| format!("invalid export.agent_ip: {ip}"))?;
        }

        Ok(())
    }
}

impl CaptureConfig {
    /// Capture direction, warning and defaulting to "both" on an
    /// invalid value.
    pub fn resolved_direction(&self) -> DirectionConfig {
        match self.direction.as_str() {
            "ingress" => DirectionConfig::Ingress,
            "egress" => DirectionConfig::Egress,
            "both" => DirectionConfig::Both,
            other => {
                warn!(direction = other, "invalid capture direction, defaulting to both");
                DirectionConfig::Both
            }
        }
    }
}

impl DedupConfig {
    /// Deduplication mode, warning and defaulting to "none" on an
    /// invalid value.
    pub fn resolved_mode(&self) -> DedupMode {
        match self.mode.as_str() {
            "none" => DedupMode::None,
            "first_come" => DedupMode::FirstCome,
            other => {
                warn!(mode = other, "invalid dedup mode, defaulting to none");
                DedupMode::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.metrics.addr, ":9090");
        assert_eq!(cfg.interfaces.listen, "watch");
        assert_eq!(cfg.interfaces.exclude_interfaces, vec!["lo".to_string()]);
        assert_eq!(cfg.cache.max_flows, 5000);
        assert_eq!(cfg.cache.active_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cache.buffers_length, 50);
        assert_eq!(cfg.capture.sampling, 1);
        assert_eq!(cfg.limiter.max_records, 10_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            "interfaces:\n  interfaces: [\"eth.*\"]\n  listen: poll\n  listen_poll_period: 2s\ncache:\n  max_flows: 100\n  active_timeout: 1s\ndedup:\n  mode: first_come\n  just_mark: true\n"
        )
        .expect("write config");

        let cfg = Config::load(file.path()).expect("load config");
        assert_eq!(cfg.interfaces.interfaces, vec!["eth.*".to_string()]);
        assert_eq!(cfg.interfaces.listen, "poll");
        assert_eq!(cfg.interfaces.listen_poll_period, Duration::from_secs(2));
        assert_eq!(cfg.cache.max_flows, 100);
        assert_eq!(cfg.dedup.resolved_mode(), DedupMode::FirstCome);
        assert!(cfg.dedup.just_mark);
    }

    #[test]
    fn test_validation_mutually_exclusive_filters() {
        let cfg = Config {
            interfaces: InterfacesConfig {
                interfaces: vec!["eth0".into()],
                interface_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_validation_ip_mode_alone_is_fine() {
        let cfg = Config {
            interfaces: InterfacesConfig {
                interface_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_max_flows() {
        let cfg = Config {
            cache: CacheConfig {
                max_flows: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_flows"));
    }

    #[test]
    fn test_validation_zero_sampling() {
        let cfg = Config {
            capture: CaptureConfig {
                sampling: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sampling"));
    }

    #[test]
    fn test_validation_unknown_export_target() {
        let cfg = Config {
            export: ExportConfig {
                target: "kafka".into(),
                agent_ip: None,
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown export target"));
    }

    #[test]
    fn test_validation_bad_agent_ip() {
        let cfg = Config {
            export: ExportConfig {
                target: "log".into(),
                agent_ip: Some("nope".into()),
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent_ip"));
    }

    #[test]
    fn test_resolved_direction() {
        let mut capture = CaptureConfig::default();
        assert_eq!(capture.resolved_direction(), DirectionConfig::Both);
        assert!(capture.resolved_direction().ingress());
        assert!(capture.resolved_direction().egress());

        capture.direction = "egress".into();
        assert_eq!(capture.resolved_direction(), DirectionConfig::Egress);
        assert!(!capture.resolved_direction().ingress());

        capture.direction = "sideways".into();
        assert_eq!(capture.resolved_direction(), DirectionConfig::Both);
    }

    #[test]
    fn test_resolved_dedup_mode_invalid_falls_back() {
        let dedup = DedupConfig {
            mode: "last_come".into(),
            ..Default::default()
        };
        assert_eq!(dedup.resolved_mode(), DedupMode::None);
    }
}
