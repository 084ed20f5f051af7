//! recvmsg/sendmsg with ancillary data.
//!
//! Receive side extracts the destination address, arrival interface and ECN
//! bits from control messages. Send side attaches the source address and
//! outbound interface (IP_PKTINFO / IPV6_PKTINFO) and, when the buffer holds
//! coalesced packets, the UDP GSO segment size.

use quicloop_x::Ecn;
use socket2::SockAddr;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

/// UDP_SEGMENT for GSO (linux/udp.h).
#[cfg(target_os = "linux")]
const UDP_SEGMENT: libc::c_int = 103;

/// Room for one pktinfo, one TOS/TCLASS and one GSO control message.
const CONTROL_LEN: usize = 128;

/// Control message buffer with cmsghdr alignment.
#[repr(C, align(8))]
struct ControlBuf([u8; CONTROL_LEN]);

/// What recvmsg reported about one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    pub len: usize,
    pub peer: SocketAddr,
    /// Destination IP of the datagram, when the kernel reported it.
    pub local_ip: Option<IpAddr>,
    pub if_index: u32,
    pub ecn: Ecn,
    /// The datagram did not fit the buffer and was cut short (MSG_TRUNC).
    pub truncated: bool,
}

/// Parameters for one send call.
#[derive(Debug, Clone, Copy)]
pub struct SendMeta {
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub if_index: u32,
    /// GSO segment size; 0 disables segmentation.
    pub segment_size: usize,
}

/// Non-blocking receive of one datagram.
///
/// Returns `WouldBlock` when the socket is drained.
pub fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvMeta> {
    // SAFETY: all-zero is a valid sockaddr_storage and msghdr; every pointer
    // stored in the msghdr refers to locals that outlive the recvmsg call.
    let mut addr_storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
    let mut control = ControlBuf([0u8; CONTROL_LEN]);
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
    msg.msg_name = &mut addr_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = CONTROL_LEN as _;

    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let peer = sockaddr_to_socket_addr(&addr_storage).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family")
    })?;

    let mut meta = RecvMeta {
        len: ret as usize,
        peer,
        local_ip: None,
        if_index: 0,
        ecn: Ecn::NotEct,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    };
    parse_control(&msg, &mut meta);
    Ok(meta)
}

#[cfg(target_os = "linux")]
fn parse_control(msg: &libc::msghdr, meta: &mut RecvMeta) {
    // SAFETY: msg was filled by recvmsg; the CMSG_* walkers stay within
    // msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let data = libc::CMSG_DATA(cmsg);
            match (hdr.cmsg_level, hdr.cmsg_type) {
                (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                    let info = std::ptr::read_unaligned(data as *const libc::in_pktinfo);
                    meta.local_ip = Some(IpAddr::V4(Ipv4Addr::from(
                        info.ipi_addr.s_addr.to_ne_bytes(),
                    )));
                    meta.if_index = info.ipi_ifindex as u32;
                }
                (libc::IPPROTO_IP, libc::IP_TOS) => {
                    meta.ecn = Ecn::from_tos(*data);
                }
                (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                    let info = std::ptr::read_unaligned(data as *const libc::in6_pktinfo);
                    meta.local_ip = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                    meta.if_index = info.ipi6_ifindex;
                }
                (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
                    let tclass = std::ptr::read_unaligned(data as *const libc::c_int);
                    meta.ecn = Ecn::from_tos(tclass as u8);
                }
                _ => {}
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn parse_control(_msg: &libc::msghdr, _meta: &mut RecvMeta) {}

/// Send one datagram (or a GSO batch) with ancillary metadata.
///
/// Returns the number of bytes accepted by the kernel.
pub fn send_msg(fd: RawFd, payload: &[u8], meta: &SendMeta) -> io::Result<usize> {
    let peer = SockAddr::from(meta.peer);
    let mut control = ControlBuf([0u8; CONTROL_LEN]);
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // SAFETY: see recv_msg.
    let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
    msg.msg_name = peer.as_ptr() as *mut libc::c_void;
    msg.msg_namelen = peer.len();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = CONTROL_LEN as _;

    let used = fill_control(&mut msg, payload.len(), meta);
    if used == 0 {
        msg.msg_control = std::ptr::null_mut();
    }
    msg.msg_controllen = used as _;

    let ret = unsafe { libc::sendmsg(fd, &msg, 0) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Write control messages and return the total control length used.
#[cfg(target_os = "linux")]
fn fill_control(msg: &mut libc::msghdr, payload_len: usize, meta: &SendMeta) -> usize {
    let mut used = 0usize;
    // msg_controllen stays at CONTROL_LEN while headers are walked; CMSG_NXTHDR
    // measures against it. The caller trims it to the returned length.
    //
    // SAFETY: msg_control points at a CONTROL_LEN buffer large enough for the
    // messages written here; CMSG_NXTHDR returns null past its end.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);

        let local_ip = meta.local.map(|a| a.ip()).filter(|ip| !ip.is_unspecified());
        match (meta.peer, local_ip) {
            (SocketAddr::V4(_), local) if local.is_some() || meta.if_index != 0 => {
                if let Some(hdr) = cmsg.as_mut() {
                    let mut info: libc::in_pktinfo = MaybeUninit::zeroed().assume_init();
                    info.ipi_ifindex = meta.if_index as libc::c_int;
                    if let Some(IpAddr::V4(ip)) = local {
                        info.ipi_spec_dst.s_addr = u32::from_ne_bytes(ip.octets());
                    }
                    hdr.cmsg_level = libc::IPPROTO_IP;
                    hdr.cmsg_type = libc::IP_PKTINFO;
                    hdr.cmsg_len = libc::CMSG_LEN(size_of::<libc::in_pktinfo>() as u32) as _;
                    std::ptr::write_unaligned(libc::CMSG_DATA(hdr) as *mut libc::in_pktinfo, info);
                    used += libc::CMSG_SPACE(size_of::<libc::in_pktinfo>() as u32) as usize;
                    cmsg = libc::CMSG_NXTHDR(msg, hdr);
                }
            }
            (SocketAddr::V6(_), local) if local.is_some() || meta.if_index != 0 => {
                if let Some(hdr) = cmsg.as_mut() {
                    let mut info: libc::in6_pktinfo = MaybeUninit::zeroed().assume_init();
                    info.ipi6_ifindex = meta.if_index;
                    if let Some(IpAddr::V6(ip)) = local {
                        info.ipi6_addr.s6_addr = ip.octets();
                    }
                    hdr.cmsg_level = libc::IPPROTO_IPV6;
                    hdr.cmsg_type = libc::IPV6_PKTINFO;
                    hdr.cmsg_len = libc::CMSG_LEN(size_of::<libc::in6_pktinfo>() as u32) as _;
                    std::ptr::write_unaligned(
                        libc::CMSG_DATA(hdr) as *mut libc::in6_pktinfo,
                        info,
                    );
                    used += libc::CMSG_SPACE(size_of::<libc::in6_pktinfo>() as u32) as usize;
                    cmsg = libc::CMSG_NXTHDR(msg, hdr);
                }
            }
            _ => {}
        }

        if meta.segment_size > 0 && meta.segment_size < payload_len {
            if let Some(hdr) = cmsg.as_mut() {
                hdr.cmsg_level = libc::SOL_UDP;
                hdr.cmsg_type = UDP_SEGMENT;
                hdr.cmsg_len = libc::CMSG_LEN(size_of::<u16>() as u32) as _;
                std::ptr::write_unaligned(
                    libc::CMSG_DATA(hdr) as *mut u16,
                    meta.segment_size as u16,
                );
                used += libc::CMSG_SPACE(size_of::<u16>() as u32) as usize;
            }
        }
    }
    used
}

#[cfg(not(target_os = "linux"))]
fn fill_control(_msg: &mut libc::msghdr, _payload_len: usize, _meta: &SendMeta) -> usize {
    0
}

/// Convert a kernel socket address into a `SocketAddr`.
pub fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    // SAFETY: the family tag selects which overlay of sockaddr_storage is valid.
    unsafe {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr = &*(storage as *const _ as *const libc::sockaddr_in);
                Some(SocketAddr::from((
                    Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be(addr.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let addr = &*(storage as *const _ as *const libc::sockaddr_in6);
                Some(SocketAddr::from((
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                )))
            }
            _ => None,
        }
    }
}
