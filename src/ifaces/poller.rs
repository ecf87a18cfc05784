//! Periodic interface enumeration.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{netlink, Event, Interface};

/// Capacity of the event channel handed to the subscriber.
const EVENT_BUFFER: usize = 16;

/// Discovers interfaces by enumerating links on a fixed period and
/// diffing against the previous round.
pub struct Poller {
    period: Duration,
}

impl Poller {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Spawn the polling task and return its event stream.
    pub fn subscribe(self, cancel: CancellationToken) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let period = self.period;

        tokio::spawn(async move {
            let mut known: HashSet<Interface> = HashSet::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let links = match tokio::task::spawn_blocking(netlink::link_dump).await {
                            Ok(Ok(links)) => links,
                            Ok(Err(e)) => {
                                warn!(error = %e, "interface poll failed");
                                continue;
                            }
                            Err(e) => {
                                warn!(error = %e, "interface poll task failed");
                                continue;
                            }
                        };

                        let current: HashSet<Interface> = links.into_iter().collect();

                        for iface in current.difference(&known) {
                            debug!(iface = %iface, "interface appeared");
                            if tx.send(Event::Added(iface.clone())).await.is_err() {
                                return;
                            }
                        }
                        for iface in known.difference(&current) {
                            debug!(iface = %iface, "interface disappeared");
                            if tx.send(Event::Removed(iface.clone())).await.is_err() {
                                return;
                            }
                        }

                        known = current;
                    }
                }
            }
        });

        Ok(rx)
    }
}
