//! Event-driven interface discovery over a netlink link subscription.

use std::collections::HashSet;

use anyhow::Result;
use neli::consts::nl::NlTypeWrapper;
use neli::rtnl::Ifinfomsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::netlink::{self, RTM_DELLINK, RTM_NEWLINK};
use super::{Event, Interface, NetNs};

/// Capacity of the event channel handed to the subscriber.
const EVENT_BUFFER: usize = 16;

/// Discovers interfaces through `RTNLGRP_LINK` notifications, preceded
/// by one full link dump so devices present at startup are announced.
pub struct Watcher {}

impl Watcher {
    pub fn new() -> Self {
        Self {}
    }

    /// Open the subscription socket, spawn the reader, and return the
    /// event stream. The socket is opened eagerly so a permissions or
    /// kernel problem surfaces at startup rather than silently.
    pub fn subscribe(self, cancel: CancellationToken) -> Result<mpsc::Receiver<Event>> {
        let mut socket = netlink::subscribe_links()?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        // The subscription read is a plain blocking recv. Dropping the
        // receiver makes the next send fail, which ends the task.
        tokio::task::spawn_blocking(move || {
            let netns = NetNs::current();
            let mut announced: HashSet<Interface> = HashSet::new();

            // Announce everything already present.
            match netlink::link_dump() {
                Ok(links) => {
                    for iface in links {
                        if !announced.insert(iface.clone()) {
                            continue;
                        }
                        debug!(iface = %iface, "existing interface");
                        if tx.blocking_send(Event::Added(iface)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "initial link dump failed"),
            }

            for m in socket.iter::<NlTypeWrapper, Ifinfomsg>(true) {
                if cancel.is_cancelled() {
                    return;
                }

                let m = match m {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "link subscription read failed");
                        return;
                    }
                };

                let msg_type = netlink::msg_type(&m.nl_type);
                if msg_type != RTM_NEWLINK && msg_type != RTM_DELLINK {
                    continue;
                }

                let payload = match m.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "link notification without payload");
                        continue;
                    }
                };

                let Some(iface) = netlink::interface_from_payload(payload, netns) else {
                    continue;
                };

                let event = if msg_type == RTM_NEWLINK {
                    // Repeated NEWLINK messages report flag changes on a
                    // device we already announced.
                    if !announced.insert(iface.clone()) {
                        continue;
                    }
                    debug!(iface = %iface, "interface added");
                    Event::Added(iface)
                } else {
                    announced.remove(&iface);
                    debug!(iface = %iface, "interface removed");
                    Event::Removed(iface)
                };

                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}
