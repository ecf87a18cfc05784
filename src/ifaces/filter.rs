//! Allow/deny policy applied before instrumenting an interface.
//!
//! Two mutually exclusive modes: name-based include/exclude regular
//! expressions, or an IP allow-list (the interface must host one of
//! the configured addresses).

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use super::{netlink, Interface};
use crate::config::InterfacesConfig;

#[derive(Debug)]
pub enum InterfaceFilter {
    /// Exclusion wins over inclusion; an empty include list allows all.
    Names {
        include: Vec<Regex>,
        exclude: Vec<Regex>,
    },
    Ips(Vec<IpAddr>),
}

impl InterfaceFilter {
    /// Build the filter from configuration. Supplying both name
    /// criteria and IP criteria is a configuration error.
    pub fn from_config(cfg: &InterfacesConfig) -> Result<Self> {
        // The stock exclude list doesn't count as a name criterion.
        let default_exclude = InterfacesConfig::default().exclude_interfaces;
        let has_names =
            !cfg.interfaces.is_empty() || cfg.exclude_interfaces != default_exclude;
        let has_ips = !cfg.interface_ips.is_empty();

        if has_names && has_ips {
            bail!(
                "interfaces/exclude_interfaces and interface_ips are mutually exclusive"
            );
        }

        if has_ips {
            let mut ips = Vec::with_capacity(cfg.interface_ips.len());
            for raw in &cfg.interface_ips {
                let ip: IpAddr = raw
                    .parse()
                    .with_context(|| format!("invalid interface_ips entry: {raw}"))?;
                ips.push(ip);
            }
            return Ok(InterfaceFilter::Ips(ips));
        }

        Ok(InterfaceFilter::Names {
            include: compile_anchored(&cfg.interfaces)?,
            exclude: compile_anchored(&cfg.exclude_interfaces)?,
        })
    }

    /// Whether the interface should be instrumented.
    pub fn allowed(&self, iface: &Interface) -> bool {
        match self {
            InterfaceFilter::Names { include, exclude } => {
                name_allowed(&iface.name, include, exclude)
            }
            InterfaceFilter::Ips(ips) => {
                let addrs = match netlink::addr_dump() {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        warn!(iface = %iface, error = %e, "address lookup failed, skipping interface");
                        return false;
                    }
                };
                let iface_addrs: Vec<IpAddr> = addrs
                    .into_iter()
                    .filter(|(idx, _)| *idx == iface.index)
                    .map(|(_, ip)| ip)
                    .collect();
                ip_allowed(ips, &iface_addrs)
            }
        }
    }
}

fn compile_anchored(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})$"))
                .with_context(|| format!("invalid interface pattern: {p}"))
        })
        .collect()
}

fn name_allowed(name: &str, include: &[Regex], exclude: &[Regex]) -> bool {
    if exclude.iter().any(|re| re.is_match(name)) {
        debug!(iface = name, "interface excluded by name");
        return false;
    }
    if include.is_empty() {
        return true;
    }
    let matched = include.iter().any(|re| re.is_match(name));
    if !matched {
        debug!(iface = name, "interface not in allow list");
    }
    matched
}

fn ip_allowed(wanted: &[IpAddr], iface_addrs: &[IpAddr]) -> bool {
    iface_addrs.iter().any(|addr| wanted.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfacesConfig;

    fn names_filter(include: &[&str], exclude: &[&str]) -> InterfaceFilter {
        InterfaceFilter::from_config(&InterfacesConfig {
            interfaces: include.iter().map(|s| s.to_string()).collect(),
            exclude_interfaces: exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .expect("valid filter")
    }

    fn check(filter: &InterfaceFilter, name: &str) -> bool {
        match filter {
            InterfaceFilter::Names { include, exclude } => name_allowed(name, include, exclude),
            InterfaceFilter::Ips(_) => unreachable!(),
        }
    }

    #[test]
    fn test_empty_criteria_allows_all() {
        let f = names_filter(&[], &[]);
        assert!(check(&f, "eth0"));
        assert!(check(&f, "lo"));
    }

    #[test]
    fn test_exclusion_wins_over_inclusion() {
        let f = names_filter(&["eth.*"], &["eth1"]);
        assert!(check(&f, "eth0"));
        assert!(!check(&f, "eth1"));
        assert!(!check(&f, "lo"));
    }

    #[test]
    fn test_patterns_are_anchored() {
        let f = names_filter(&["eth0"], &[]);
        assert!(check(&f, "eth0"));
        assert!(!check(&f, "veth0"));
        assert!(!check(&f, "eth01"));
    }

    #[test]
    fn test_both_modes_is_config_error() {
        let err = InterfaceFilter::from_config(&InterfacesConfig {
            interfaces: vec!["eth0".into()],
            interface_ips: vec!["10.0.0.1".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_invalid_ip_is_config_error() {
        let err = InterfaceFilter::from_config(&InterfacesConfig {
            interface_ips: vec!["not-an-ip".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("invalid interface_ips entry"));
    }

    #[test]
    fn test_ip_mode_matches_hosted_address() {
        let wanted = vec!["10.0.0.7".parse().unwrap()];
        assert!(ip_allowed(
            &wanted,
            &["10.0.0.7".parse().unwrap(), "fe80::1".parse().unwrap()]
        ));
        assert!(!ip_allowed(&wanted, &["10.0.0.8".parse().unwrap()]));
        assert!(!ip_allowed(&wanted, &[]));
    }
}
