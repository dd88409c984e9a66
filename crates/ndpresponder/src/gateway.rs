//! Default gateway discovery and neighbor pinning
//!
//! Runs once at startup, before the responder starts:
//!
//! ```text
//! NoGateway ──(default route)──▶ SearchingNeighbor ──▶ NeighborPinned
//!                                   │    ▲          └──▶ NeighborExternallyManaged
//!                                   └────┘ provoke + sleep (Retry)
//! ```
//!
//! With [`GatewayWait::Forever`] the search never gives up, so startup blocks
//! until the gateway shows up in the neighbor cache or the process is killed.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CP-10: System Recovery - All gateway state is rebuilt on every start
//! - SC-7: Boundary Protection - Only the configured link is inspected

use crate::netlink::NeighborTable;
use crate::types::{HostInfo, MacAddress, NeighborEntry, NeighborState, RouteEntry};
use std::net::Ipv6Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Default interval between resolution attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How long the neighbor search may block startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayWait {
    /// Never give up
    Forever,
    /// Give up after this long and continue with the gateway unpinned
    Timeout(Duration),
}

impl GatewayWait {
    /// `0` seconds means forever
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Forever
        } else {
            Self::Timeout(Duration::from_secs(secs))
        }
    }
}

/// Outcome of one pass over the neighbor cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborScan {
    /// Resolved entry that should be switched to NOARP
    Pin(NeighborEntry),
    /// PERMANENT entry owned by someone else; leave it alone
    ExternallyManaged,
    /// No usable entry yet
    Retry,
}

/// Where the resolver ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    NoGateway,
    NeighborPinned,
    NeighborExternallyManaged,
    /// Gateway known, but its neighbor entry was not confirmed or could not be written
    Unpinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub host: HostInfo,
    pub state: ResolverState,
}

/// Discovers the IPv6 default gateway and pins its neighbor entry
#[derive(Debug, Clone)]
pub struct GatewayResolver {
    host_mac: MacAddress,
    wait: GatewayWait,
    retry_interval: Duration,
}

impl GatewayResolver {
    pub fn new(host_mac: MacAddress, wait: GatewayWait, retry_interval: Duration) -> Self {
        Self {
            host_mac,
            wait,
            retry_interval,
        }
    }

    /// Run the resolution procedure against `table`.
    ///
    /// Never fails: every error degrades to a [`HostInfo`] with less
    /// information and is logged.
    #[instrument(skip_all, fields(mac = %self.host_mac))]
    pub async fn resolve<T: NeighborTable>(&self, table: &T) -> Resolution {
        let mut host = HostInfo {
            host_mac: self.host_mac,
            gateway: None,
        };

        let routes = match table.list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                error!(error = %e, "Failed to list routes");
                return Resolution {
                    host,
                    state: ResolverState::NoGateway,
                };
            }
        };

        let Some(gateway) = find_default_gateway(&routes) else {
            warn!("No default gateway");
            return Resolution {
                host,
                state: ResolverState::NoGateway,
            };
        };
        host.gateway = Some(gateway);
        info!(gateway = %gateway, "Found gateway");

        let deadline = match self.wait {
            GatewayWait::Forever => None,
            GatewayWait::Timeout(limit) => Some(Instant::now() + limit),
        };

        loop {
            let neighbors = match table.list_neighbors() {
                Ok(neighbors) => neighbors,
                Err(e) => {
                    error!(error = %e, "Failed to list neighbors");
                    return Resolution {
                        host,
                        state: ResolverState::Unpinned,
                    };
                }
            };

            match scan_neighbors(&neighbors, gateway) {
                NeighborScan::Pin(entry) => {
                    let state = pin_neighbor(table, entry);
                    return Resolution { host, state };
                }
                NeighborScan::ExternallyManaged => {
                    info!(gateway = %gateway, "Gateway neighbor is PERMANENT, leaving it unchanged");
                    return Resolution {
                        host,
                        state: ResolverState::NeighborExternallyManaged,
                    };
                }
                NeighborScan::Retry => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(gateway = %gateway, "Gave up waiting for gateway neighbor entry");
                    return Resolution {
                        host,
                        state: ResolverState::Unpinned,
                    };
                }
            }

            if let Err(e) = table.provoke(gateway) {
                warn!(gateway = %gateway, error = %e, "Failed to send echo request to gateway");
            }
            debug!("Waiting for gateway neighbor entry");
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Gateway of the first route with no destination prefix
pub fn find_default_gateway(routes: &[RouteEntry]) -> Option<Ipv6Addr> {
    routes
        .iter()
        .filter(|route| route.is_default())
        .find_map(|route| route.gateway)
}

/// Look for a resolved neighbor entry for `gateway`
pub fn scan_neighbors(neighbors: &[NeighborEntry], gateway: Ipv6Addr) -> NeighborScan {
    for neigh in neighbors {
        if neigh.ip != gateway || neigh.mac.is_none() {
            continue;
        }
        match neigh.state {
            NeighborState::Reachable | NeighborState::NoArp => {
                return NeighborScan::Pin(neigh.clone());
            }
            NeighborState::Permanent => return NeighborScan::ExternallyManaged,
            _ => {}
        }
    }
    NeighborScan::Retry
}

fn pin_neighbor<T: NeighborTable>(table: &T, mut entry: NeighborEntry) -> ResolverState {
    entry.state = NeighborState::NoArp;
    let lladdr = entry.mac.unwrap_or(MacAddress::ZERO);
    match table.set_neighbor(&entry) {
        Ok(()) => {
            info!(lladdr = %lladdr, "Pinned gateway neighbor entry");
            ResolverState::NeighborPinned
        }
        Err(e) => {
            error!(error = %e, "Failed to pin gateway neighbor entry");
            ResolverState::Unpinned
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NdpError;
    use crate::netlink::MockNeighborTable;
    use mockall::Sequence;

    const HOST_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
    const GW_MAC: MacAddress = MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn gw() -> Ipv6Addr {
        "fe80::1".parse().unwrap()
    }

    fn resolver(wait: GatewayWait) -> GatewayResolver {
        GatewayResolver::new(HOST_MAC, wait, Duration::from_millis(1))
    }

    fn default_route() -> RouteEntry {
        RouteEntry {
            destination_prefix_len: 0,
            gateway: Some(gw()),
            oif: Some(2),
            ..RouteEntry::default()
        }
    }

    fn neighbor(state: NeighborState) -> NeighborEntry {
        NeighborEntry {
            ifindex: 2,
            ip: gw(),
            mac: Some(GW_MAC),
            state,
        }
    }

    #[test]
    fn test_find_default_gateway() {
        let prefix = RouteEntry {
            destination_prefix_len: 64,
            destination: Some("2001:db8::".parse().unwrap()),
            gateway: Some("fe80::99".parse().unwrap()),
            oif: Some(2),
        };
        assert_eq!(find_default_gateway(&[prefix.clone()]), None);
        assert_eq!(find_default_gateway(&[prefix, default_route()]), Some(gw()));

        let on_link = RouteEntry::default();
        assert_eq!(find_default_gateway(&[on_link]), None);
    }

    #[test]
    fn test_scan_neighbors() {
        assert_eq!(
            scan_neighbors(&[neighbor(NeighborState::Reachable)], gw()),
            NeighborScan::Pin(neighbor(NeighborState::Reachable))
        );
        assert_eq!(
            scan_neighbors(&[neighbor(NeighborState::NoArp)], gw()),
            NeighborScan::Pin(neighbor(NeighborState::NoArp))
        );
        assert_eq!(
            scan_neighbors(&[neighbor(NeighborState::Permanent)], gw()),
            NeighborScan::ExternallyManaged
        );
        assert_eq!(
            scan_neighbors(&[neighbor(NeighborState::Stale)], gw()),
            NeighborScan::Retry
        );

        let mut unresolved = neighbor(NeighborState::Reachable);
        unresolved.mac = None;
        assert_eq!(scan_neighbors(&[unresolved], gw()), NeighborScan::Retry);

        let mut other = neighbor(NeighborState::Reachable);
        other.ip = "fe80::2".parse().unwrap();
        assert_eq!(scan_neighbors(&[other], gw()), NeighborScan::Retry);
    }

    #[tokio::test]
    async fn test_no_default_route_returns_immediately() {
        let mut table = MockNeighborTable::new();
        table.expect_list_routes().times(1).returning(|| {
            Ok(vec![RouteEntry {
                destination_prefix_len: 64,
                ..RouteEntry::default()
            }])
        });
        table.expect_list_neighbors().never();
        table.expect_provoke().never();
        table.expect_set_neighbor().never();

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.host.gateway, None);
        assert_eq!(res.host.host_mac, HOST_MAC);
        assert_eq!(res.state, ResolverState::NoGateway);
    }

    #[tokio::test]
    async fn test_route_error_degrades_to_no_gateway() {
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Err(NdpError::Netlink("boom".into())));

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.host.gateway, None);
        assert_eq!(res.state, ResolverState::NoGateway);
    }

    #[tokio::test]
    async fn test_reachable_neighbor_is_pinned() {
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        table
            .expect_list_neighbors()
            .times(1)
            .returning(|| Ok(vec![neighbor(NeighborState::Reachable)]));
        table.expect_provoke().never();
        table
            .expect_set_neighbor()
            .withf(|entry| entry.state == NeighborState::NoArp && entry.mac == Some(GW_MAC))
            .times(1)
            .returning(|_| Ok(()));

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.host.gateway, Some(gw()));
        assert_eq!(res.state, ResolverState::NeighborPinned);
    }

    #[tokio::test]
    async fn test_permanent_neighbor_is_left_alone() {
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        table
            .expect_list_neighbors()
            .returning(|| Ok(vec![neighbor(NeighborState::Permanent)]));
        table.expect_set_neighbor().never();

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.host.gateway, Some(gw()));
        assert_eq!(res.state, ResolverState::NeighborExternallyManaged);
    }

    #[tokio::test]
    async fn test_retries_until_neighbor_resolves() {
        let mut seq = Sequence::new();
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        for _ in 0..2 {
            table
                .expect_list_neighbors()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Ok(vec![neighbor(NeighborState::Incomplete)]));
            table
                .expect_provoke()
                .withf(|addr| *addr == "fe80::1".parse::<Ipv6Addr>().unwrap())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        table
            .expect_list_neighbors()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![neighbor(NeighborState::Reachable)]));
        table
            .expect_set_neighbor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.state, ResolverState::NeighborPinned);
    }

    #[tokio::test]
    async fn test_provoke_failure_is_not_fatal() {
        let mut seq = Sequence::new();
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        table
            .expect_list_neighbors()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![]));
        table
            .expect_provoke()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(NdpError::Transport("unreachable".into())));
        table
            .expect_list_neighbors()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![neighbor(NeighborState::NoArp)]));
        table.expect_set_neighbor().returning(|_| Ok(()));

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.state, ResolverState::NeighborPinned);
    }

    #[tokio::test]
    async fn test_pin_failure_is_not_fatal() {
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        table
            .expect_list_neighbors()
            .returning(|| Ok(vec![neighbor(NeighborState::Reachable)]));
        table
            .expect_set_neighbor()
            .returning(|_| Err(NdpError::Netlink("EPERM".into())));

        let res = resolver(GatewayWait::Forever).resolve(&table).await;
        assert_eq!(res.host.gateway, Some(gw()));
        assert_eq!(res.state, ResolverState::Unpinned);
    }

    #[tokio::test]
    async fn test_timeout_gives_up() {
        let mut table = MockNeighborTable::new();
        table
            .expect_list_routes()
            .returning(|| Ok(vec![default_route()]));
        table.expect_list_neighbors().returning(|| Ok(vec![]));
        table.expect_provoke().returning(|_| Ok(()));
        table.expect_set_neighbor().never();

        let resolver = GatewayResolver::new(
            HOST_MAC,
            GatewayWait::Timeout(Duration::from_millis(50)),
            Duration::from_millis(5),
        );
        let res = resolver.resolve(&table).await;
        assert_eq!(res.host.gateway, Some(gw()));
        assert_eq!(res.state, ResolverState::Unpinned);
    }

    #[test]
    fn test_gateway_wait_from_secs() {
        assert_eq!(GatewayWait::from_secs(0), GatewayWait::Forever);
        assert_eq!(
            GatewayWait::from_secs(30),
            GatewayWait::Timeout(Duration::from_secs(30))
        );
    }
}
