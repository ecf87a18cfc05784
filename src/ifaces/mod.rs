//! Network interface discovery and filtering.
//!
//! Produces a stream of add/remove events for the interfaces the agent
//! should instrument, either by periodic enumeration or by a netlink
//! link subscription.

pub mod filter;
pub mod namer;
pub mod netlink;
pub mod poller;
pub mod watcher;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::MetadataExt;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use self::poller::Poller;
use self::watcher::Watcher;
use crate::config::InterfacesConfig;

pub use self::filter::InterfaceFilter;
pub use self::namer::InterfaceNamer;

/// Identity of a network namespace: the inode of its `ns/net` file.
/// `None` when the namespace could not be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetNs(pub Option<u64>);

impl NetNs {
    /// Namespace of the calling process.
    pub fn current() -> Self {
        match std::fs::metadata("/proc/self/ns/net") {
            Ok(m) => NetNs(Some(m.ino())),
            Err(_) => NetNs(None),
        }
    }
}

impl fmt::Display for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(ino) => write!(f, "net:[{ino}]"),
            None => write!(f, "unknown"),
        }
    }
}

/// A network device to instrument.
///
/// Identity is the `(index, netns)` pair; the name is informational
/// (device renames do not change identity). Used as the key for every
/// per-interface map in the fetcher.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub netns: NetNs,
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.netns == other.netns
    }
}

impl Eq for Interface {}

impl Hash for Interface {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.netns.hash(state);
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (index {}, {})", self.name, self.index, self.netns)
    }
}

/// Interface lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added(Interface),
    Removed(Interface),
}

/// Discovery strategy, selected by configuration.
pub enum Informer {
    Poll(Poller),
    Watch(Watcher),
}

impl Informer {
    /// Build the informer named by `cfg.listen`. An unknown value logs
    /// a warning and falls back to the netlink watcher.
    pub fn from_config(cfg: &InterfacesConfig) -> Self {
        match cfg.listen.as_str() {
            "poll" => Informer::Poll(Poller::new(cfg.listen_poll_period)),
            "watch" => Informer::Watch(Watcher::new()),
            other => {
                warn!(
                    listen = other,
                    "invalid interface listen method, defaulting to watch",
                );
                Informer::Watch(Watcher::new())
            }
        }
    }

    /// Start discovery in the background, returning the event stream.
    pub fn subscribe(self, cancel: CancellationToken) -> Result<mpsc::Receiver<Event>> {
        match self {
            Informer::Poll(p) => p.subscribe(cancel),
            Informer::Watch(w) => w.subscribe(cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_interface_identity_ignores_name() {
        let a = Interface {
            name: "eth0".into(),
            index: 2,
            netns: NetNs(Some(10)),
        };
        let b = Interface {
            name: "renamed0".into(),
            index: 2,
            netns: NetNs(Some(10)),
        };
        let c = Interface {
            name: "eth0".into(),
            index: 2,
            netns: NetNs(Some(11)),
        };

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = HashMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_informer_invalid_listen_defaults_to_watch() {
        let cfg = InterfacesConfig {
            listen: "bogus".into(),
            ..Default::default()
        };
        assert!(matches!(Informer::from_config(&cfg), Informer::Watch(_)));

        let cfg = InterfacesConfig {
            listen: "poll".into(),
            ..Default::default()
        };
        assert!(matches!(Informer::from_config(&cfg), Informer::Poll(_)));
    }
}
