//! UDP endpoint creation for the socket backend.
//!
//! Every endpoint is configured so the scheduler can report accurate
//! metadata upstream:
//! - Destination address and arrival interface (IP_PKTINFO / IPV6_RECVPKTINFO)
//! - ECN marks (IP_RECVTOS / IPV6_RECVTCLASS)
//! - The port actually bound, which differs from the request when port 0 asks
//!   for an ephemeral assignment
//! - Optional kernel buffer sizes and SO_REUSEPORT for multi-worker binding

use super::config::AddressFamily;
use super::endpoint::{Endpoint, EndpointRole};
use crate::error::BindError;
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

/// Options applied to every endpoint opened by [`open_endpoints`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// Applied to both SO_SNDBUF and SO_RCVBUF; failure is logged only.
    pub buffer_size: Option<usize>,
    /// Allow several workers to bind the same port.
    pub reuse_port: bool,
}

/// One bound UDP socket.
#[derive(Debug)]
pub struct SocketEndpoint {
    socket: Option<UdpSocket>,
    family: AddressFamily,
    local_port: u16,
    role: EndpointRole,
}

impl SocketEndpoint {
    /// Raw descriptor while the endpoint is open.
    #[inline]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[inline]
    pub fn socket(&self) -> Option<&UdpSocket> {
        self.socket.as_ref()
    }
}

impl Endpoint for SocketEndpoint {
    fn family(&self) -> AddressFamily {
        self.family
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn role(&self) -> EndpointRole {
        self.role
    }

    fn set_role(&mut self, role: EndpointRole) {
        self.role = role;
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            tracing::trace!(
                family = self.family.name(),
                port = self.local_port,
                "Endpoint closed"
            );
            drop(socket);
        }
    }
}

/// Families to open for a request.
pub fn families_for(family: AddressFamily) -> &'static [AddressFamily] {
    match family {
        AddressFamily::Unspec => &[AddressFamily::V4, AddressFamily::V6],
        AddressFamily::V4 => &[AddressFamily::V4],
        AddressFamily::V6 => &[AddressFamily::V6],
    }
}

/// Open one endpoint per requested family, all bound to `local_port`.
///
/// Either every endpoint is opened or none is: on failure the endpoints
/// already opened by this call are closed before the error is returned.
pub fn open_endpoints(
    local_port: u16,
    family: AddressFamily,
    max_endpoints: usize,
    options: &SocketOptions,
) -> Result<Vec<SocketEndpoint>, BindError> {
    let families = families_for(family);
    if families.len() > max_endpoints {
        return Err(BindError::TooManyEndpoints {
            requested: families.len(),
            max: max_endpoints,
        });
    }

    let mut opened: Vec<SocketEndpoint> = Vec::with_capacity(families.len());
    for &af in families {
        match open_endpoint(local_port, af, options) {
            Ok(ep) => opened.push(ep),
            Err(e) => {
                tracing::debug!(
                    family = af.name(),
                    port = local_port,
                    error = %e,
                    "Cannot set up socket, closing endpoints opened so far"
                );
                for ep in &mut opened {
                    ep.close();
                }
                return Err(e);
            }
        }
    }

    Ok(opened)
}

/// Open and configure a single endpoint.
pub fn open_endpoint(
    local_port: u16,
    family: AddressFamily,
    options: &SocketOptions,
) -> Result<SocketEndpoint, BindError> {
    let (domain, bind_addr) = match family {
        AddressFamily::V4 => (
            Domain::IPV4,
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)),
        ),
        AddressFamily::V6 => (
            Domain::IPV6,
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, local_port)),
        ),
        AddressFamily::Unspec => {
            return Err(BindError::Socket {
                family: family.name(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "a concrete address family is required",
                ),
            })
        }
    };
    let fam = family.name();

    let socket = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| BindError::Socket { family: fam, source })?;

    if family == AddressFamily::V6 {
        socket
            .set_only_v6(true)
            .map_err(|source| sock_opt_err(fam, "IPV6_V6ONLY", source))?;
    }

    enable_ecn_reception(&socket, family).map_err(|source| {
        sock_opt_err(
            fam,
            if family == AddressFamily::V4 {
                "IP_RECVTOS"
            } else {
                "IPV6_RECVTCLASS"
            },
            source,
        )
    })?;

    enable_pktinfo(&socket, family).map_err(|source| {
        sock_opt_err(
            fam,
            if family == AddressFamily::V4 {
                "IP_PKTINFO"
            } else {
                "IPV6_RECVPKTINFO"
            },
            source,
        )
    })?;

    if options.reuse_port {
        configure_reuse_port(&socket).map_err(|source| sock_opt_err(fam, "SO_REUSEPORT", source))?;
    }

    socket
        .bind(&bind_addr.into())
        .map_err(|source| BindError::Bind {
            family: fam,
            port: local_port,
            source,
        })?;

    let local = socket
        .local_addr()
        .map_err(|source| BindError::LocalAddr { family: fam, source })?;
    let bound_port = local.as_socket().map(|a| a.port()).unwrap_or(0);

    if let Some(size) = options.buffer_size {
        apply_buffer_size(&socket, size, family);
    }

    socket
        .set_nonblocking(true)
        .map_err(|source| sock_opt_err(fam, "O_NONBLOCK", source))?;

    tracing::debug!(family = fam, port = bound_port, "Endpoint bound");

    Ok(SocketEndpoint {
        socket: Some(socket.into()),
        family,
        local_port: bound_port,
        role: EndpointRole::Primary,
    })
}

/// Loopback address on which a local test harness reaches the endpoint.
pub fn loopback_addr(family: AddressFamily, port: u16) -> SocketAddr {
    match family {
        AddressFamily::V6 => SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
        _ => SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
    }
}

fn sock_opt_err(family: &'static str, option: &'static str, source: std::io::Error) -> BindError {
    BindError::SocketOption {
        family,
        option,
        source,
    }
}

/// Set SO_SNDBUF and SO_RCVBUF; failures are logged with the value the
/// kernel kept.
fn apply_buffer_size(socket: &Socket2, size: usize, family: AddressFamily) {
    if let Err(e) = socket.set_send_buffer_size(size) {
        tracing::warn!(
            family = family.name(),
            requested = size,
            actual = ?socket.send_buffer_size().ok(),
            error = %e,
            "Cannot set SO_SNDBUF"
        );
    }
    if let Err(e) = socket.set_recv_buffer_size(size) {
        tracing::warn!(
            family = family.name(),
            requested = size,
            actual = ?socket.recv_buffer_size().ok(),
            error = %e,
            "Cannot set SO_RCVBUF"
        );
    }
}

fn setsockopt_int(
    socket: &Socket2,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    use std::mem::size_of_val;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of_val(&value) as libc::socklen_t,
        )
    };

    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Ask the kernel to report the TOS byte / traffic class with each datagram.
#[cfg(target_os = "linux")]
fn enable_ecn_reception(socket: &Socket2, family: AddressFamily) -> std::io::Result<()> {
    match family {
        AddressFamily::V4 => setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_RECVTOS, 1),
        _ => setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS, 1),
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_ecn_reception(_socket: &Socket2, _family: AddressFamily) -> std::io::Result<()> {
    tracing::debug!("ECN reception not available on this platform");
    Ok(())
}

/// Ask the kernel to report destination address and interface index.
#[cfg(target_os = "linux")]
fn enable_pktinfo(socket: &Socket2, family: AddressFamily) -> std::io::Result<()> {
    match family {
        AddressFamily::V4 => setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_PKTINFO, 1),
        _ => setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1),
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_socket: &Socket2, _family: AddressFamily) -> std::io::Result<()> {
    tracing::debug!("Packet info reception not available on this platform");
    Ok(())
}

/// Configure SO_REUSEPORT on supported platforms.
///
/// SO_REUSEPORT lets every worker bind the same port; the kernel spreads
/// incoming datagrams across them.
#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
fn configure_reuse_port(socket: &Socket2) -> std::io::Result<()> {
    match setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1) {
        Err(err) => match err.raw_os_error() {
            // Gracefully handle if SO_REUSEPORT is not supported
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {
                tracing::warn!("SO_REUSEPORT not supported on this platform");
                Ok(())
            }
            _ => Err(err),
        },
        Ok(()) => Ok(()),
    }
}

/// Stub for platforms that don't support SO_REUSEPORT
#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
)))]
fn configure_reuse_port(_socket: &Socket2) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}
