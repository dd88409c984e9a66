//! Dynamic source networks: endpoint tracking and new-address notification
//!
//! One task owns every per-network [`AddressSet`]. After each refresh it
//! publishes the union as a fresh `Arc<AddressSet>` through a `watch`
//! channel, so readers always see a complete snapshot, and announces newly
//! seen addresses on a `broadcast` channel.
//!
//! The event subscription is opened before the first full refresh and asks
//! for events since that moment, so nothing that happens in between is lost.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Tracks endpoint addresses per network
//! - SI-4: System Monitoring - Reacts to connect/disconnect events
//! - CP-10: System Recovery - Event stream is re-subscribed after failure

use crate::error::{NdpError, Result};
use crate::ipset::AddressSet;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Notification queue depth; the oldest entries are dropped when full
pub const NOTIFICATION_CAPACITY: usize = 64;

/// Delay before re-subscribing to a failed event stream
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// How long a fresh subscription may stay silent before it counts as live
pub const SUBSCRIBE_CHECK: Duration = Duration::from_millis(500);

/// One container attached to a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Container identifier
    pub id: String,
    /// IPv6 address, if the container has one on this network
    pub address: Option<Ipv6Addr>,
}

/// Full endpoint list of one network at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub id: String,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connect,
    Disconnect,
}

/// A container joined or left a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub kind: EventKind,
    /// Network name
    pub network: String,
    /// Container identifier
    pub endpoint: String,
}

/// Which endpoints of a refreshed network may be announced as new
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSelector {
    All,
    Endpoint(String),
}

impl EndpointSelector {
    pub fn matches(&self, endpoint_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Endpoint(id) => id == endpoint_id,
        }
    }
}

/// Orchestrator capability: read a network, stream its membership changes
#[async_trait]
pub trait NetworkSource: Send + Sync {
    /// Current endpoint list of the named network
    async fn inspect(&self, network: &str) -> Result<NetworkSnapshot>;

    /// Connect/disconnect events for the named networks, replaying anything
    /// that happened at or after `since`
    fn events(&self, networks: &[String], since: SystemTime)
    -> BoxStream<'_, Result<NetworkEvent>>;
}

/// Per-network address sets and their published union
pub struct DynamicMembership {
    per_network: HashMap<String, AddressSet>,
    active: watch::Sender<Arc<AddressSet>>,
    new_addrs: broadcast::Sender<Ipv6Addr>,
}

impl Default for DynamicMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicMembership {
    pub fn new() -> Self {
        let (active, _) = watch::channel(Arc::new(AddressSet::empty()));
        let (new_addrs, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            per_network: HashMap::new(),
            active,
            new_addrs,
        }
    }

    /// Receiver of active-union snapshots
    pub fn active(&self) -> watch::Receiver<Arc<AddressSet>> {
        self.active.subscribe()
    }

    /// Receiver of newly observed addresses. Only sees addresses announced
    /// after this call.
    pub fn notifications(&self) -> broadcast::Receiver<Ipv6Addr> {
        self.new_addrs.subscribe()
    }

    /// Current active union
    pub fn snapshot(&self) -> Arc<AddressSet> {
        self.active.borrow().clone()
    }

    /// Replace one network's set with `snapshot`, republish the union and
    /// announce the new addresses.
    ///
    /// An address is new when its endpoint is selected and it was not in the
    /// network's previous set. Returns the announced addresses.
    pub fn apply(&mut self, snapshot: &NetworkSnapshot, selector: &EndpointSelector) -> Vec<Ipv6Addr> {
        let previous = self.per_network.get(&snapshot.id);
        let fresh: Vec<Ipv6Addr> = snapshot
            .endpoints
            .iter()
            .filter(|ep| selector.matches(&ep.id))
            .filter_map(|ep| ep.address)
            .filter(|addr| previous.is_none_or(|set| !set.contains(addr)))
            .collect();

        let set = AddressSet::from_addresses(snapshot.endpoints.iter().filter_map(|ep| ep.address));
        self.per_network.insert(snapshot.id.clone(), set);

        let union = AddressSet::union(self.per_network.values());
        self.active.send_replace(Arc::new(union));

        for addr in &fresh {
            // No receivers is fine; the union is still published
            let _ = self.new_addrs.send(*addr);
        }
        fresh
    }
}

/// Keeps [`DynamicMembership`] in sync with the configured networks
pub struct DynamicSourceWatcher<S> {
    source: S,
    networks: Vec<String>,
    membership: DynamicMembership,
}

impl<S: NetworkSource> DynamicSourceWatcher<S> {
    pub fn new(source: S, networks: Vec<String>, membership: DynamicMembership) -> Self {
        Self {
            source,
            networks,
            membership,
        }
    }

    /// Start [`run`](Self::run) on its own task and wait for the first
    /// subscription and full refresh.
    ///
    /// A subscription that fails or ends right away is returned as an error
    /// and the task stops. Later failures are retried.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>>
    where
        S: 'static,
    {
        let (started_tx, started_rx) = oneshot::channel();
        let handle = tokio::spawn(self.follow(cancel, Some(started_tx)));
        match started_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            // Cancelled before the first refresh finished
            Err(_) => Ok(handle),
        }
    }

    /// Subscribe, refresh every network, then follow events until cancelled.
    ///
    /// Stream failures are logged; the watcher waits [`RESUBSCRIBE_DELAY`],
    /// subscribes again and does another full refresh.
    pub async fn run(self, cancel: CancellationToken) {
        self.follow(cancel, None).await
    }

    #[instrument(skip_all, fields(networks = ?self.networks))]
    async fn follow(
        mut self,
        cancel: CancellationToken,
        mut started: Option<oneshot::Sender<Result<()>>>,
    ) {
        if self.networks.is_empty() {
            debug!("No dynamic source networks configured");
            if let Some(tx) = started.take() {
                let _ = tx.send(Ok(()));
            }
            return;
        }

        loop {
            let since = SystemTime::now();
            let mut events = self.source.events(&self.networks, since);
            let mut pending = match first_event(&mut events).await {
                Ok(first) => first,
                Err(e) => {
                    if let Some(tx) = started.take() {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(error = %e, "Failed to subscribe to network events");
                    drop(events);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                    continue;
                }
            };

            for name in &self.networks {
                refresh(&self.source, &mut self.membership, name, &EndpointSelector::All).await;
            }
            if let Some(tx) = started.take() {
                let _ = tx.send(Ok(()));
            }

            loop {
                let item = match pending.take() {
                    Some(event) => Some(Ok(event)),
                    None => tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = events.next() => item,
                    },
                };
                match item {
                    Some(Ok(event)) => {
                        if !self.networks.contains(&event.network) {
                            debug!(network = %event.network, "Ignoring event for unconfigured network");
                            continue;
                        }
                        match event.kind {
                            EventKind::Connect => info!(
                                network = %event.network,
                                endpoint = %event.endpoint,
                                "Endpoint connected"
                            ),
                            EventKind::Disconnect => info!(
                                network = %event.network,
                                endpoint = %event.endpoint,
                                "Endpoint disconnected"
                            ),
                        }
                        let selector = EndpointSelector::Endpoint(event.endpoint);
                        refresh(&self.source, &mut self.membership, &event.network, &selector)
                            .await;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Network event stream failed");
                        break;
                    }
                    None => {
                        warn!("Network event stream ended");
                        break;
                    }
                }
            }
            drop(events);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            info!("Re-subscribing to network events");
        }
    }
}

/// Poll a fresh subscription until it errors, yields, or stays quiet for
/// [`SUBSCRIBE_CHECK`]. A quiet stream is live.
async fn first_event(
    events: &mut BoxStream<'_, Result<NetworkEvent>>,
) -> Result<Option<NetworkEvent>> {
    match tokio::time::timeout(SUBSCRIBE_CHECK, events.next()).await {
        Err(_quiet) => Ok(None),
        Ok(Some(Ok(event))) => Ok(Some(event)),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(NdpError::Subscription("event stream ended immediately".into())),
    }
}

/// Read one network and apply it; errors keep the stale set
async fn refresh<S: NetworkSource>(
    source: &S,
    membership: &mut DynamicMembership,
    name: &str,
    selector: &EndpointSelector,
) {
    let snapshot = match source.inspect(name).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(network = %name, error = %e, "Failed to read network");
            return;
        }
    };

    let ips: Vec<Ipv6Addr> = snapshot
        .endpoints
        .iter()
        .filter_map(|ep| ep.address)
        .collect();
    let fresh = membership.apply(&snapshot, selector);
    info!(network = %snapshot.name, ip = ?ips, new = fresh.len(), "Active IPs updated");
}
