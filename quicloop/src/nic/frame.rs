//! Ethernet / IP / UDP framing for the NIC backend.
//!
//! Kernel bypass means the loop writes and parses link-layer frames itself.
//! Only the shapes the packet loop produces are supported: untagged (or single
//! 802.1Q tagged on receive) Ethernet carrying IPv4 without options or IPv6
//! without extension headers, carrying UDP.

use quicloop_x::Ecn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use thiserror::Error;

pub const ETH_HDR_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;

pub type MacAddr = [u8; 6];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame needs {needed} bytes, buffer holds {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("source and destination address families differ")]
    FamilyMismatch,

    #[error("UDP payload of {0} bytes does not fit in one datagram")]
    PayloadTooLarge(usize),
}

/// Addressing of an outbound frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub ecn: Ecn,
}

/// Addressing extracted from an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub ecn: Ecn,
    /// Location of the UDP payload inside the frame.
    pub payload: Range<usize>,
}

/// Total frame length for a payload sent to an address of `dst`'s family.
#[inline]
pub fn frame_len(dst: &SocketAddr, payload_len: usize) -> usize {
    let ip = match dst {
        SocketAddr::V4(_) => IPV4_HDR_LEN,
        SocketAddr::V6(_) => IPV6_HDR_LEN,
    };
    ETH_HDR_LEN + ip + UDP_HDR_LEN + payload_len
}

/// Write a complete frame into `out` and return its length.
pub fn build_udp_frame(
    out: &mut [u8],
    header: &FrameHeader,
    payload: &[u8],
) -> Result<usize, FrameError> {
    let udp_len = UDP_HDR_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let needed = frame_len(&header.dst, payload.len());
    if out.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    out[0..6].copy_from_slice(&header.dst_mac);
    out[6..12].copy_from_slice(&header.src_mac);

    let udp_off = match (header.src.ip(), header.dst.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            if IPV4_HDR_LEN + udp_len > u16::MAX as usize {
                return Err(FrameError::PayloadTooLarge(payload.len()));
            }
            out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
            let ip = &mut out[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN];
            ip[0] = 0x45;
            ip[1] = header.ecn.bits();
            ip[2..4].copy_from_slice(&((IPV4_HDR_LEN + udp_len) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&0u16.to_be_bytes());
            // Don't fragment
            ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
            ip[8] = DEFAULT_TTL;
            ip[9] = IPPROTO_UDP;
            ip[10..12].copy_from_slice(&0u16.to_be_bytes());
            ip[12..16].copy_from_slice(&src.octets());
            ip[16..20].copy_from_slice(&dst.octets());
            let csum = internet_checksum(ip);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
            ETH_HDR_LEN + IPV4_HDR_LEN
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            out[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
            let ip = &mut out[ETH_HDR_LEN..ETH_HDR_LEN + IPV6_HDR_LEN];
            // Version 6, traffic class carries ECN in its low bits, no flow label.
            let vtf: u32 = (6 << 28) | ((header.ecn.bits() as u32) << 20);
            ip[0..4].copy_from_slice(&vtf.to_be_bytes());
            ip[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            ip[6] = IPPROTO_UDP;
            ip[7] = DEFAULT_TTL;
            ip[8..24].copy_from_slice(&src.octets());
            ip[24..40].copy_from_slice(&dst.octets());
            ETH_HDR_LEN + IPV6_HDR_LEN
        }
        _ => return Err(FrameError::FamilyMismatch),
    };

    let udp = &mut out[udp_off..udp_off + udp_len];
    udp[0..2].copy_from_slice(&header.src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&header.dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[6..8].copy_from_slice(&0u16.to_be_bytes());
    udp[UDP_HDR_LEN..].copy_from_slice(payload);

    let csum = udp_checksum(header.src.ip(), header.dst.ip(), udp);
    udp[6..8].copy_from_slice(&csum.to_be_bytes());

    Ok(udp_off + udp_len)
}

/// Parse an inbound frame. Returns `None` for anything that is not a
/// well-formed UDP datagram.
pub fn parse_udp_frame(frame: &[u8]) -> Option<ParsedFrame> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    let mut l3 = ETH_HDR_LEN;
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < ETH_HDR_LEN + VLAN_TAG_LEN {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        l3 += VLAN_TAG_LEN;
    }

    let (src_ip, dst_ip, ecn, udp_off, l3_end) = match ethertype {
        ETHERTYPE_IPV4 => {
            let ip = frame.get(l3..l3 + IPV4_HDR_LEN)?;
            if ip[0] >> 4 != 4 || ip[9] != IPPROTO_UDP {
                return None;
            }
            let ihl = ((ip[0] & 0x0F) as usize) * 4;
            let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
            if ihl < IPV4_HDR_LEN || total < ihl + UDP_HDR_LEN {
                return None;
            }
            let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
            let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
            (
                IpAddr::V4(src),
                IpAddr::V4(dst),
                Ecn::from_tos(ip[1]),
                l3 + ihl,
                l3 + total,
            )
        }
        ETHERTYPE_IPV6 => {
            let ip = frame.get(l3..l3 + IPV6_HDR_LEN)?;
            if ip[0] >> 4 != 6 || ip[6] != IPPROTO_UDP {
                return None;
            }
            let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
            let tclass = ((ip[0] & 0x0F) << 4) | (ip[1] >> 4);
            let src: [u8; 16] = ip[8..24].try_into().ok()?;
            let dst: [u8; 16] = ip[24..40].try_into().ok()?;
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                Ecn::from_tos(tclass),
                l3 + IPV6_HDR_LEN,
                l3 + IPV6_HDR_LEN + payload_len,
            )
        }
        _ => return None,
    };

    if l3_end > frame.len() {
        return None;
    }
    let udp = frame.get(udp_off..udp_off + UDP_HDR_LEN)?;
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < UDP_HDR_LEN || udp_off + udp_len > l3_end {
        return None;
    }

    Some(ParsedFrame {
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        ecn,
        payload: udp_off + UDP_HDR_LEN..udp_off + udp_len,
    })
}

/// One's complement sum folded to 16 bits, without the final inversion.
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

/// RFC 1071 checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !(ones_complement_sum(0, data) as u16)
}

/// UDP checksum over the pseudo header and the UDP segment (header with a
/// zero checksum field, plus payload).
pub fn udp_checksum(src: IpAddr, dst: IpAddr, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = ones_complement_sum(sum, &s.octets());
            sum = ones_complement_sum(sum, &d.octets());
        }
        (s, d) => {
            sum = ones_complement_sum(sum, &ip_octets(s));
            sum = ones_complement_sum(sum, &ip_octets(d));
        }
    }
    sum += IPPROTO_UDP as u32;
    sum += segment.len() as u32;
    sum = ones_complement_sum(sum, segment);
    match !(sum as u16) {
        // Zero means "no checksum" for IPv4 and is illegal for IPv6.
        0 => 0xFFFF,
        csum => csum,
    }
}

fn ip_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
