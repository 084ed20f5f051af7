//! The transport seam between the scheduler and a backend.
//!
//! Both backends (kernel sockets and NIC queues) present the same surface:
//! an endpoint set, a way to open one more endpoint for migration tests, a
//! bounded wait that hands every received datagram to a callback, and a send
//! that carries the source address, interface and segment size.

use crate::error::BindError;
use crate::netio::{AddressFamily, Endpoint, EndpointSet, SendMeta};
use quicloop_x::Ecn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// One received datagram, borrowed for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    /// Index of the endpoint it arrived on.
    pub endpoint: usize,
    pub peer: SocketAddr,
    /// Destination IP, when the backend knows it.
    pub local_ip: Option<IpAddr>,
    pub if_index: u32,
    pub ecn: Ecn,
    pub payload: &'a [u8],
}

/// Totals of one receive wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvSummary {
    pub datagrams: usize,
    pub bytes: usize,
}

impl RecvSummary {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.datagrams == 0
    }

    #[inline]
    pub fn add(&mut self, bytes: usize) {
        self.datagrams += 1;
        self.bytes += bytes;
    }
}

/// A packet transport driven by one scheduler.
pub trait Transport {
    type Endpoint: Endpoint;

    fn endpoints(&self) -> &EndpointSet<Self::Endpoint>;

    fn endpoints_mut(&mut self) -> &mut EndpointSet<Self::Endpoint>;

    /// Open a fresh endpoint outside the set (migration tests).
    fn open_endpoint(&mut self, family: AddressFamily, port: u16)
        -> Result<Self::Endpoint, BindError>;

    /// Wait up to `timeout` for traffic and hand every datagram that arrived
    /// to `on_datagram`, in arrival order per endpoint.
    ///
    /// A zero timeout polls once without blocking.
    fn receive(
        &mut self,
        timeout: Duration,
        on_datagram: &mut dyn FnMut(Datagram<'_>),
    ) -> io::Result<RecvSummary>;

    /// Send `payload` through endpoint `endpoint`.
    fn send(&mut self, endpoint: usize, payload: &[u8], meta: &SendMeta) -> io::Result<usize>;

    /// Push out anything the backend staged during the send phase.
    fn flush(&mut self) {}

    /// Whether the backend can take a coalesced buffer with a segment size.
    fn supports_gso(&self) -> bool;

    /// Release every endpoint.
    fn close(&mut self) {
        self.endpoints_mut().close_all();
    }
}

/// Unspecified address of the same family as `peer`.
pub(crate) fn unspecified_like(peer: &SocketAddr) -> IpAddr {
    match peer {
        SocketAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}
