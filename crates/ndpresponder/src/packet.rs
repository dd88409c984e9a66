//! Ethernet + IPv6 + ICMPv6 Neighbor Discovery codec
//!
//! Decodes captured Neighbor Solicitations and builds the three frames the
//! daemon transmits: solicited Neighbor Advertisements, gratuitous
//! solicitations for newly seen addresses, and solicitations that make the
//! default gateway learn an address. Pure functions, no I/O.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Every layer of a captured frame is
//!   validated before any field is used
//! - SC-5: DoS Protection - Malformed frames are dropped without error paths

use crate::error::{NdpError, Result};
use crate::types::{MacAddress, NeighSolicitation};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmpv6::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmpv6::ndp::{
    MutableNeighborAdvertPacket, MutableNeighborSolicitPacket, NdpOption, NdpOptionType,
    NdpOptionTypes, NeighborSolicitPacket,
};
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use std::net::Ipv6Addr;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV6_HDR_LEN: usize = 40;
/// ICMPv6 header plus reserved/flags word plus target address
pub const NDP_MSG_LEN: usize = 24;
/// One 8-octet NDP option carrying a 6-byte value
pub const NDP_OPT_LEN: usize = 8;
pub const ICMPV6_ECHO_LEN: usize = 8;

/// Neighbor Advertisement flag bits (RFC 4861 section 4.4)
pub const ADVERT_FLAG_ROUTER: u8 = 0x80;
pub const ADVERT_FLAG_SOLICITED: u8 = 0x40;
pub const ADVERT_FLAG_OVERRIDE: u8 = 0x20;

/// NDP Nonce option (RFC 3971 section 5.3.2)
pub const NDP_OPT_NONCE: NdpOptionType = NdpOptionType(14);

const NDP_HOP_LIMIT: u8 = 255;

/// All-nodes link-local multicast group
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Classic BPF program for `icmp6 && ip6[40]==135`, as `(code, jt, jf, k)`
pub const NEIGHBOR_SOLICIT_FILTER: [(u16, u8, u8, u32); 11] = [
    (0x28, 0, 0, 0x0000000c),
    (0x15, 0, 8, 0x000086dd),
    (0x30, 0, 0, 0x00000014),
    (0x15, 3, 0, 0x0000003a),
    (0x15, 0, 5, 0x0000002c),
    (0x30, 0, 0, 0x00000036),
    (0x15, 0, 3, 0x0000003a),
    (0x30, 0, 0, 0x00000036),
    (0x15, 0, 1, 0x00000087),
    (0x6, 0, 0, 0x00040000),
    (0x6, 0, 0, 0x00000000),
];

/// Solicited-node multicast group `ff02::1:ffXX:XXXX` for an address
pub fn solicited_node_multicast(addr: &Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

/// Ethernet destination for the solicited-node group of an address
pub fn solicited_node_mac(addr: &Ipv6Addr) -> MacAddress {
    MacAddress::ipv6_multicast(&solicited_node_multicast(addr))
}

/// Decode a captured frame into a Neighbor Solicitation.
///
/// Returns `None` unless the frame is exactly Ethernet / IPv6 / ICMPv6
/// Neighbor Solicitation with hop limit 255 and a well-formed option chain.
pub fn decode(frame: &[u8]) -> Option<NeighSolicitation> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv6 {
        return None;
    }

    let ip6 = Ipv6Packet::new(eth.payload())?;
    if ip6.get_version() != 6 || ip6.get_next_header() != IpNextHeaderProtocols::Icmpv6 {
        return None;
    }
    // RFC 4861 section 7.1.1: anything forwarded by a router is not from the link
    if ip6.get_hop_limit() != NDP_HOP_LIMIT {
        return None;
    }
    let body = ip6.payload();
    if body.len() < usize::from(ip6.get_payload_length()) {
        return None;
    }

    let icmp = Icmpv6Packet::new(body)?;
    if icmp.get_icmpv6_type() != Icmpv6Types::NeighborSolicit || icmp.get_icmpv6_code().0 != 0 {
        return None;
    }

    let solicit = NeighborSolicitPacket::new(body)?;
    if !options_well_formed(&body[NDP_MSG_LEN..]) {
        return None;
    }

    Some(NeighSolicitation {
        router_mac: eth.get_source().into(),
        router_ip: ip6.get_source(),
        dest_ip: ip6.get_destination(),
        target_ip: solicit.get_target_addr(),
    })
}

/// Every option must have a non-zero length that fits the remaining bytes
fn options_well_formed(mut options: &[u8]) -> bool {
    while !options.is_empty() {
        if options.len() < 2 {
            return false;
        }
        let len = usize::from(options[1]) * 8;
        if len == 0 || len > options.len() {
            return false;
        }
        options = &options[len..];
    }
    true
}

/// Build a Neighbor Advertisement answering `ns` on behalf of its target.
///
/// Flags are Router|Solicited, plus Override when the solicitation was sent to
/// a multicast group. A solicitation from the unspecified address is Duplicate
/// Address Detection: the answer goes to all-nodes with Router|Override and
/// Solicited clear (RFC 4861 section 7.2.4). The Target Link-Layer Address
/// option carries `host_mac`.
pub fn encode_advertisement(ns: &NeighSolicitation, host_mac: MacAddress) -> Result<Vec<u8>> {
    let (dst_mac, dst_ip, flags) = if ns.router_ip.is_unspecified() {
        (
            MacAddress::ipv6_multicast(&ALL_NODES),
            ALL_NODES,
            ADVERT_FLAG_ROUTER | ADVERT_FLAG_OVERRIDE,
        )
    } else if ns.is_multicast() {
        (
            ns.router_mac,
            ns.router_ip,
            ADVERT_FLAG_ROUTER | ADVERT_FLAG_SOLICITED | ADVERT_FLAG_OVERRIDE,
        )
    } else {
        (
            ns.router_mac,
            ns.router_ip,
            ADVERT_FLAG_ROUTER | ADVERT_FLAG_SOLICITED,
        )
    };

    let icmp_len = NDP_MSG_LEN + NDP_OPT_LEN;
    let mut buf = vec![0u8; ETH_HDR_LEN + IPV6_HDR_LEN + icmp_len];
    write_headers(&mut buf, host_mac, dst_mac, ns.target_ip, dst_ip, icmp_len)?;

    {
        let mut advert = MutableNeighborAdvertPacket::new(&mut buf[ETH_HDR_LEN + IPV6_HDR_LEN..])
            .ok_or_else(|| NdpError::Encode("advertisement buffer too small".into()))?;
        advert.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
        advert.set_icmpv6_code(Icmpv6Code(0));
        advert.set_flags(flags);
        advert.set_reserved(0);
        advert.set_target_addr(ns.target_ip);
        advert.set_options(&[NdpOption {
            option_type: NdpOptionTypes::TargetLLAddr,
            length: 1,
            data: host_mac.octets().to_vec(),
        }]);
    }

    finish_icmpv6(&mut buf, ns.target_ip, dst_ip)?;
    Ok(buf)
}

/// Build an unsolicited multicast solicitation announcing `target`.
///
/// Sent from the unspecified address to the solicited-node group of `target`,
/// carrying a random Nonce option instead of a Source Link-Layer Address.
pub fn encode_gratuitous_solicitation(host_mac: MacAddress, target: Ipv6Addr) -> Result<Vec<u8>> {
    let nonce: [u8; 6] = rand::random();
    encode_solicitation(
        host_mac,
        Ipv6Addr::UNSPECIFIED,
        target,
        NdpOption {
            option_type: NDP_OPT_NONCE,
            length: 1,
            data: nonce.to_vec(),
        },
    )
}

/// Build a solicitation for `gateway` sourced from `source`.
///
/// The Source Link-Layer Address option carries `host_mac`, so the gateway
/// learns `source -> host_mac` while answering.
pub fn encode_gateway_solicitation(
    host_mac: MacAddress,
    source: Ipv6Addr,
    gateway: Ipv6Addr,
) -> Result<Vec<u8>> {
    encode_solicitation(
        host_mac,
        source,
        gateway,
        NdpOption {
            option_type: NdpOptionTypes::SourceLLAddr,
            length: 1,
            data: host_mac.octets().to_vec(),
        },
    )
}

fn encode_solicitation(
    host_mac: MacAddress,
    source: Ipv6Addr,
    target: Ipv6Addr,
    option: NdpOption,
) -> Result<Vec<u8>> {
    if option.data.len() != NDP_OPT_LEN - 2 {
        return Err(NdpError::Encode(format!(
            "option payload must be {} bytes, got {}",
            NDP_OPT_LEN - 2,
            option.data.len()
        )));
    }

    let group = solicited_node_multicast(&target);
    let icmp_len = NDP_MSG_LEN + NDP_OPT_LEN;
    let mut buf = vec![0u8; ETH_HDR_LEN + IPV6_HDR_LEN + icmp_len];
    write_headers(
        &mut buf,
        host_mac,
        MacAddress::ipv6_multicast(&group),
        source,
        group,
        icmp_len,
    )?;

    {
        let mut solicit =
            MutableNeighborSolicitPacket::new(&mut buf[ETH_HDR_LEN + IPV6_HDR_LEN..])
                .ok_or_else(|| NdpError::Encode("solicitation buffer too small".into()))?;
        solicit.set_icmpv6_type(Icmpv6Types::NeighborSolicit);
        solicit.set_icmpv6_code(Icmpv6Code(0));
        solicit.set_reserved(0);
        solicit.set_target_addr(target);
        solicit.set_options(&[option]);
    }

    finish_icmpv6(&mut buf, source, group)?;
    Ok(buf)
}

/// ICMPv6 Echo Request body for a raw ICMPv6 socket; the kernel fills the checksum
pub fn encode_echo_request(identifier: u16, sequence: u16) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; ICMPV6_ECHO_LEN];
    let mut echo = MutableEchoRequestPacket::new(&mut buf)
        .ok_or_else(|| NdpError::Encode("echo request buffer too small".into()))?;
    echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
    echo.set_icmpv6_code(Icmpv6Code(0));
    echo.set_identifier(identifier);
    echo.set_sequence_number(sequence);
    Ok(buf)
}

fn write_headers(
    buf: &mut [u8],
    src_mac: MacAddress,
    dst_mac: MacAddress,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    payload_len: usize,
) -> Result<()> {
    let payload_len = u16::try_from(payload_len)
        .map_err(|_| NdpError::Encode(format!("payload too large: {payload_len}")))?;

    let mut eth = MutableEthernetPacket::new(&mut buf[..ETH_HDR_LEN])
        .ok_or_else(|| NdpError::Encode("ethernet buffer too small".into()))?;
    eth.set_destination(dst_mac.into());
    eth.set_source(src_mac.into());
    eth.set_ethertype(EtherTypes::Ipv6);

    let mut ip6 = MutableIpv6Packet::new(&mut buf[ETH_HDR_LEN..ETH_HDR_LEN + IPV6_HDR_LEN])
        .ok_or_else(|| NdpError::Encode("ipv6 buffer too small".into()))?;
    ip6.set_version(6);
    ip6.set_traffic_class(0);
    ip6.set_flow_label(0);
    ip6.set_payload_length(payload_len);
    ip6.set_next_header(IpNextHeaderProtocols::Icmpv6);
    ip6.set_hop_limit(NDP_HOP_LIMIT);
    ip6.set_source(src_ip);
    ip6.set_destination(dst_ip);
    Ok(())
}

fn finish_icmpv6(buf: &mut [u8], src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> Result<()> {
    let body = &mut buf[ETH_HDR_LEN + IPV6_HDR_LEN..];
    let sum = Icmpv6Packet::new(&*body)
        .map(|icmp| pnet::packet::icmpv6::checksum(&icmp, &src_ip, &dst_ip))
        .ok_or_else(|| NdpError::Encode("icmpv6 buffer too small".into()))?;
    let mut icmp = MutableIcmpv6Packet::new(body)
        .ok_or_else(|| NdpError::Encode("icmpv6 buffer too small".into()))?;
    icmp.set_checksum(sum);
    Ok(())
}
