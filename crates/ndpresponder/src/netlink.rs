//! Kernel route and neighbor table access over rtnetlink
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for network state
//! - AC-3: Access Enforcement - Neighbor writes require CAP_NET_ADMIN
//! - AU-12: Audit Record Generation - Neighbor writes are logged by callers

use crate::error::{NdpError, Result};
use crate::packet;
use crate::types::{MacAddress, NeighborEntry, NeighborState, RouteEntry};
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkHeader,
    NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use parking_lot::Mutex;
use nix::sys::socket::{
    AddressFamily as SocketFamily, MsgFlags, SockFlag, SockProtocol, SockType, SockaddrIn6,
    sendto, setsockopt, socket, sockopt,
};
use std::ffi::OsString;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, instrument, trace};

/// Route and neighbor operations scoped to one interface.
///
/// The gateway resolver only talks to this trait, so tests can drive it with
/// a mock table.
#[cfg_attr(test, mockall::automock)]
pub trait NeighborTable {
    /// IPv6 routes whose output interface is this link
    fn list_routes(&self) -> Result<Vec<RouteEntry>>;

    /// IPv6 neighbor cache entries on this link
    fn list_neighbors(&self) -> Result<Vec<NeighborEntry>>;

    /// Replace a single neighbor entry
    fn set_neighbor(&self, entry: &NeighborEntry) -> Result<()>;

    /// Send traffic to `addr` so the kernel starts resolving it
    fn provoke(&self, addr: Ipv6Addr) -> Result<()>;
}

/// Main routing table id (RT_TABLE_MAIN)
const RT_TABLE_MAIN: u32 = 254;

/// Whether a request with `flags` is answered by more than one datagram,
/// ending in NLMSG_DONE or an ack
fn waits_for_terminator(flags: u16) -> bool {
    flags & (NLM_F_DUMP | NLM_F_ACK) != 0
}

/// Request/response rtnetlink socket
pub struct NetlinkSocket {
    socket: Socket,
    sequence: u32,
}

impl NetlinkSocket {
    /// Create a netlink route socket connected to the kernel
    #[instrument]
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| NdpError::Netlink(format!("Failed to create socket: {}", e)))?;
        socket
            .bind_auto()
            .map_err(|e| NdpError::Netlink(format!("Failed to bind socket: {}", e)))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| NdpError::Netlink(format!("Failed to connect socket: {}", e)))?;

        debug!("Netlink route socket ready");
        Ok(Self {
            socket,
            sequence: 0,
        })
    }

    /// Send one request and collect every inner message of the reply.
    ///
    /// Dumps end on NLMSG_DONE; acknowledged requests end on the ack.
    fn request(
        &mut self,
        payload: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        self.sequence = self.sequence.wrapping_add(1);

        let mut header = NetlinkHeader::default();
        header.flags = flags;
        header.sequence_number = self.sequence;

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);

        self.socket
            .send(&buf, 0)
            .map_err(|e| NdpError::Netlink(format!("Failed to send request: {}", e)))?;

        let mut replies = Vec::new();
        loop {
            let (data, _) = self
                .socket
                .recv_from_full()
                .map_err(|e| NdpError::Netlink(format!("Failed to receive: {}", e)))?;

            let mut offset = 0;
            while offset < data.len() {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&data[offset..])
                    .map_err(|e| NdpError::Netlink(format!("Failed to parse message: {}", e)))?;

                let length = msg.header.length as usize;
                if length == 0 {
                    return Err(NdpError::Netlink("zero-length netlink message".into()));
                }
                // Align to 4 bytes (netlink alignment requirement)
                offset = (offset + length + 3) & !3;

                if msg.header.sequence_number != self.sequence {
                    trace!(seq = msg.header.sequence_number, "Skipping unrelated message");
                    continue;
                }

                match msg.payload {
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::Error(err) => {
                        return match err.code {
                            Some(code) => Err(NdpError::Netlink(format!(
                                "kernel rejected request: {}",
                                std::io::Error::from_raw_os_error(-code.get())
                            ))),
                            None => Ok(replies),
                        };
                    }
                    _ => {}
                }
            }

            if !waits_for_terminator(flags) {
                return Ok(replies);
            }
        }
    }

    /// Dump the IPv6 routing table
    #[instrument(skip(self))]
    pub fn dump_routes(&mut self) -> Result<Vec<RouteEntry>> {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet6;

        let replies = self.request(
            RouteNetlinkMessage::GetRoute(msg),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;

        let routes: Vec<RouteEntry> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewRoute(route) => parse_route(&route),
                _ => None,
            })
            .collect();
        trace!(count = routes.len(), "Dumped IPv6 routes");
        Ok(routes)
    }

    /// Dump the IPv6 neighbor table
    #[instrument(skip(self))]
    pub fn dump_neighbors(&mut self) -> Result<Vec<NeighborEntry>> {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet6;

        let replies = self.request(
            RouteNetlinkMessage::GetNeighbour(msg),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;

        let neighbors: Vec<NeighborEntry> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewNeighbour(neigh) => parse_neighbor(&neigh),
                _ => None,
            })
            .collect();
        trace!(count = neighbors.len(), "Dumped IPv6 neighbors");
        Ok(neighbors)
    }

    /// Create or replace one neighbor entry (RTM_NEWNEIGH with NLM_F_REPLACE)
    #[instrument(skip(self), fields(ip = %entry.ip, state = ?entry.state))]
    pub fn replace_neighbor(&mut self, entry: &NeighborEntry) -> Result<()> {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet6;
        msg.header.ifindex = entry.ifindex;
        msg.header.state = NeighbourState::from(entry.state.to_kernel());
        msg.attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(
                entry.ip,
            )));
        if let Some(mac) = entry.mac {
            msg.attributes
                .push(NeighbourAttribute::LinkLocalAddress(mac.octets().to_vec()));
        }

        self.request(
            RouteNetlinkMessage::NewNeighbour(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        )?;
        Ok(())
    }
}

/// Convert one dumped route, keeping IPv6 routes of the main table only
fn parse_route(route: &RouteMessage) -> Option<RouteEntry> {
    if route.header.address_family != AddressFamily::Inet6 {
        return None;
    }

    // Table ids above 255 only travel in RTA_TABLE
    let table = route
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(id) => Some(*id),
            _ => None,
        })
        .unwrap_or(u32::from(route.header.table));
    if table != RT_TABLE_MAIN {
        return None;
    }

    let mut entry = RouteEntry {
        destination_prefix_len: route.header.destination_prefix_length,
        ..RouteEntry::default()
    };
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                entry.destination = Some(*addr);
            }
            RouteAttribute::Gateway(RouteAddress::Inet6(addr)) => {
                entry.gateway = Some(*addr);
            }
            RouteAttribute::Oif(index) => entry.oif = Some(*index),
            _ => {}
        }
    }
    Some(entry)
}

fn parse_neighbor(neigh: &NeighbourMessage) -> Option<NeighborEntry> {
    if neigh.header.family != AddressFamily::Inet6 {
        return None;
    }

    let mut ip = None;
    let mut mac = None;
    for attr in &neigh.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(addr)) => ip = Some(*addr),
            NeighbourAttribute::LinkLocalAddress(bytes) => mac = MacAddress::from_slice(bytes),
            _ => {}
        }
    }

    Some(NeighborEntry {
        ifindex: neigh.header.ifindex,
        ip: ip?,
        mac,
        state: NeighborState::from_kernel(u16::from(neigh.header.state)),
    })
}

/// Raw ICMPv6 socket bound to one interface, used to send Echo Requests
pub struct EchoProber {
    fd: OwnedFd,
    ifindex: u32,
    identifier: u16,
}

impl EchoProber {
    /// Open a raw ICMPv6 socket bound to `ifname`
    ///
    /// # NIST Controls
    /// - AC-3: Access Enforcement - Raw sockets require CAP_NET_RAW
    #[instrument]
    pub fn new(ifname: &str, ifindex: u32) -> Result<Self> {
        let fd = socket(
            SocketFamily::Inet6,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::IcmpV6,
        )
        .map_err(|e| NdpError::Transport(format!("Failed to create ICMPv6 socket: {}", e)))?;

        setsockopt(&fd, sockopt::BindToDevice, &OsString::from(ifname))
            .map_err(|e| NdpError::Transport(format!("Failed to bind to {}: {}", ifname, e)))?;

        Ok(Self {
            fd,
            ifindex,
            identifier: rand::random(),
        })
    }

    /// Send one ICMPv6 Echo Request to `addr`
    pub fn send_echo(&self, addr: Ipv6Addr) -> Result<()> {
        let body = packet::encode_echo_request(self.identifier, 1)?;
        let dest = SockaddrIn6::from(SocketAddrV6::new(addr, 0, 0, self.ifindex));

        sendto(self.fd.as_raw_fd(), &body, &dest, MsgFlags::empty())
            .map_err(|e| NdpError::Transport(format!("Failed to send echo to {}: {}", addr, e)))?;
        Ok(())
    }
}

/// [`NeighborTable`] backed by rtnetlink, scoped to one interface
pub struct NetlinkNeighborTable {
    socket: Mutex<NetlinkSocket>,
    prober: EchoProber,
    ifindex: u32,
}

impl NetlinkNeighborTable {
    pub fn new(ifname: &str, ifindex: u32) -> Result<Self> {
        Ok(Self {
            socket: Mutex::new(NetlinkSocket::new()?),
            prober: EchoProber::new(ifname, ifindex)?,
            ifindex,
        })
    }
}

impl NeighborTable for NetlinkNeighborTable {
    fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        let routes = self.socket.lock().dump_routes()?;
        Ok(routes
            .into_iter()
            .filter(|r| r.oif == Some(self.ifindex))
            .collect())
    }

    fn list_neighbors(&self) -> Result<Vec<NeighborEntry>> {
        let neighbors = self.socket.lock().dump_neighbors()?;
        Ok(neighbors
            .into_iter()
            .filter(|n| n.ifindex == self.ifindex)
            .collect())
    }

    fn set_neighbor(&self, entry: &NeighborEntry) -> Result<()> {
        self.socket.lock().replace_neighbor(entry)
    }

    fn provoke(&self, addr: Ipv6Addr) -> Result<()> {
        self.prober.send_echo(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_route() -> RouteMessage {
        let mut route = RouteMessage::default();
        route.header.address_family = AddressFamily::Inet6;
        route.header.table = RT_TABLE_MAIN as u8;
        route
    }

    #[test]
    fn test_terminator_flags() {
        assert!(waits_for_terminator(NLM_F_REQUEST | NLM_F_DUMP));
        assert!(waits_for_terminator(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE
        ));
        assert!(!waits_for_terminator(NLM_F_REQUEST));
    }

    #[test]
    fn test_parse_default_route() {
        let mut route = main_route();
        route.header.destination_prefix_length = 0;
        route
            .attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet6(
                "fe80::1".parse().unwrap(),
            )));
        route.attributes.push(RouteAttribute::Oif(3));

        let entry = parse_route(&route).unwrap();
        assert!(entry.is_default());
        assert_eq!(entry.gateway, Some("fe80::1".parse().unwrap()));
        assert_eq!(entry.oif, Some(3));
        assert_eq!(entry.destination, None);
    }

    #[test]
    fn test_parse_prefix_route() {
        let mut route = main_route();
        route.header.destination_prefix_length = 64;
        route
            .attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet6(
                "2001:db8::".parse().unwrap(),
            )));

        let entry = parse_route(&route).unwrap();
        assert!(!entry.is_default());
        assert_eq!(entry.destination, Some("2001:db8::".parse().unwrap()));
        assert_eq!(entry.gateway, None);
    }

    #[test]
    fn test_parse_route_skips_other_tables() {
        let mut local = main_route();
        local.header.table = 255;
        local
            .attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet6(
                "fe80::1".parse().unwrap(),
            )));
        assert!(parse_route(&local).is_none());

        // policy table announced in RTA_TABLE, header says compat
        let mut policy = main_route();
        policy.header.table = 252;
        policy.attributes.push(RouteAttribute::Table(1000));
        assert!(parse_route(&policy).is_none());

        let mut main_by_attr = main_route();
        main_by_attr.header.table = 252;
        main_by_attr.attributes.push(RouteAttribute::Table(RT_TABLE_MAIN));
        assert!(parse_route(&main_by_attr).unwrap().is_default());
    }

    #[test]
    fn test_parse_route_ignores_ipv4() {
        let mut route = RouteMessage::default();
        route.header.address_family = AddressFamily::Inet;
        assert!(parse_route(&route).is_none());
    }

    #[test]
    fn test_parse_neighbor() {
        let mut neigh = NeighbourMessage::default();
        neigh.header.family = AddressFamily::Inet6;
        neigh.header.ifindex = 2;
        neigh.header.state = NeighbourState::from(0x02u16);
        neigh
            .attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(
                "fe80::1".parse().unwrap(),
            )));
        neigh
            .attributes
            .push(NeighbourAttribute::LinkLocalAddress(vec![0, 0x11, 0x22, 0x33, 0x44, 0x55]));

        let entry = parse_neighbor(&neigh).unwrap();
        assert_eq!(entry.ifindex, 2);
        assert_eq!(entry.ip, "fe80::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(entry.mac, Some(MacAddress([0, 0x11, 0x22, 0x33, 0x44, 0x55])));
        assert_eq!(entry.state, NeighborState::Reachable);
    }

    #[test]
    fn test_parse_neighbor_unusual_lladdr() {
        let mut neigh = NeighbourMessage::default();
        neigh.header.family = AddressFamily::Inet6;
        neigh
            .attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(
                "fe80::1".parse().unwrap(),
            )));
        neigh
            .attributes
            .push(NeighbourAttribute::LinkLocalAddress(vec![1, 2, 3, 4]));

        let entry = parse_neighbor(&neigh).unwrap();
        assert_eq!(entry.mac, None);
    }

    #[test]
    fn test_parse_neighbor_without_address() {
        let mut neigh = NeighbourMessage::default();
        neigh.header.family = AddressFamily::Inet6;
        assert!(parse_neighbor(&neigh).is_none());
    }
}
