//! Core types shared by the codec, the gateway resolver and the responder
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Neighbor and route entries
//! - IA-3: Device Identification - MAC addresses for device identification

use std::fmt;
use std::net::Ipv6Addr;

/// MAC address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Zero MAC address
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);

    /// Build from a slice, which must be exactly 6 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Check if this is a zero MAC
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Ethernet multicast MAC for an IPv6 multicast group (RFC 2464 section 7)
    pub fn ipv6_multicast(group: &Ipv6Addr) -> Self {
        let o = group.octets();
        Self([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<pnet::util::MacAddr> for MacAddress {
    fn from(mac: pnet::util::MacAddr) -> Self {
        Self([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5])
    }
}

impl From<MacAddress> for pnet::util::MacAddr {
    fn from(mac: MacAddress) -> Self {
        let [a, b, c, d, e, f] = mac.0;
        pnet::util::MacAddr::new(a, b, c, d, e, f)
    }
}

/// Kernel neighbor state (NUD_* values from linux/neighbour.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NeighborState {
    /// Neighbor is incomplete (resolution in progress)
    Incomplete = 0x01,
    /// Neighbor is reachable
    Reachable = 0x02,
    /// Neighbor reachability is stale
    Stale = 0x04,
    /// Neighbor resolution delayed
    Delay = 0x08,
    /// Neighbor probe in progress
    Probe = 0x10,
    /// Neighbor resolution failed
    Failed = 0x20,
    /// No ARP needed (static or local)
    NoArp = 0x40,
    /// Permanent entry
    Permanent = 0x80,
    /// Unknown state
    Unknown = 0x00,
}

impl NeighborState {
    /// Create from kernel NUD_* value
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// Kernel NUD_* value
    pub fn to_kernel(self) -> u16 {
        self as u16
    }
}

/// Neighbor table entry for one IPv6 address on one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    /// Interface index
    pub ifindex: u32,
    /// Neighbor IPv6 address
    pub ip: Ipv6Addr,
    /// Link-layer address, present only when the kernel reports exactly 6 bytes
    pub mac: Option<MacAddress>,
    /// Kernel neighbor state
    pub state: NeighborState,
}

/// IPv6 route table entry, reduced to what gateway discovery needs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteEntry {
    /// Destination prefix length; 0 for the default route
    pub destination_prefix_len: u8,
    pub destination: Option<Ipv6Addr>,
    pub gateway: Option<Ipv6Addr>,
    /// Output interface index
    pub oif: Option<u32>,
}

impl RouteEntry {
    /// A route with no destination prefix
    pub fn is_default(&self) -> bool {
        self.destination_prefix_len == 0
    }
}

/// Address information of the host machine, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub host_mac: MacAddress,
    /// Default gateway on the configured link, if one was found
    pub gateway: Option<Ipv6Addr>,
}

/// Fields of one captured ICMPv6 Neighbor Solicitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighSolicitation {
    pub router_mac: MacAddress,
    pub router_ip: Ipv6Addr,
    /// Destination address of the IPv6 header
    pub dest_ip: Ipv6Addr,
    pub target_ip: Ipv6Addr,
}

impl NeighSolicitation {
    /// Multicast destination means a "who-has" query; unicast is a reachability probe
    pub fn is_multicast(&self) -> bool {
        self.dest_ip.is_multicast()
    }
}

impl fmt::Display for NeighSolicitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multicast() {
            write!(f, "who-has {} tell {}", self.target_ip, self.router_ip)
        } else {
            write!(f, "is-alive {} tell {}", self.target_ip, self.router_ip)
        }
    }
}
