//! NIC queue transport.
//!
//! A worker owns exactly one RX/TX queue pair. Endpoints are UDP ports the
//! loop answers on; there is no kernel, so ports are tracked here and
//! port 0 takes the next free port from the dynamic range. Frames are built
//! and parsed by [`crate::nic::frame`] and transmitted through the queue's
//! staging buffer, flushed at the end of each send phase.
//!
//! Waiting is hybrid: the queue is busy-polled for `spin_polls` empty polls,
//! after which the worker sleeps in `idle_sleep` slices, never past the
//! deadline.

use super::transport::{Datagram, RecvSummary, Transport};
use crate::error::BindError;
use crate::netio::socket::families_for;
use crate::netio::{AddressFamily, Endpoint, EndpointRole, EndpointSet, NetIoConfig, SendMeta};
use crate::nic::frame::{build_udp_frame, parse_udp_frame, FrameError, FrameHeader};
use crate::nic::{MacAddr, NicConfig, NicQueue, PacketBuf};
use crate::telemetry::{record_metric, MetricsEvent};
use quicloop_x::Ecn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// First port handed out for port-0 requests.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// A UDP port served by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicEndpoint {
    family: AddressFamily,
    port: u16,
    role: EndpointRole,
    open: bool,
}

impl NicEndpoint {
    pub fn new(family: AddressFamily, port: u16) -> Self {
        Self {
            family,
            port,
            role: EndpointRole::Primary,
            open: true,
        }
    }
}

impl Endpoint for NicEndpoint {
    fn family(&self) -> AddressFamily {
        self.family
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn role(&self) -> EndpointRole {
        self.role
    }

    fn set_role(&mut self, role: EndpointRole) {
        self.role = role;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

pub struct NicQueueTransport {
    queue: NicQueue,
    endpoints: EndpointSet<NicEndpoint>,
    local_mac: MacAddr,
    peer_mac: MacAddr,
    /// Source addresses by preference: the queue's steering address first.
    local_ips: Vec<IpAddr>,
    next_ephemeral: u16,
    rx: Vec<PacketBuf>,
    rx_burst: usize,
    spin_polls: u32,
    idle_sleep: Duration,
}

impl std::fmt::Debug for NicQueueTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NicQueueTransport")
            .field("queue", &self.queue)
            .field("endpoints", &self.endpoints)
            .field("local_ips", &self.local_ips)
            .finish()
    }
}

impl NicQueueTransport {
    /// Serve `port` for `family` on a provisioned queue.
    ///
    /// `bind_addr` is the address flow rules steer to this queue; it is the
    /// preferred source address for outbound frames.
    pub fn open(
        queue: NicQueue,
        port: u16,
        family: AddressFamily,
        bind_addr: Option<IpAddr>,
        nic: &NicConfig,
        netio: &NetIoConfig,
    ) -> Result<Self, BindError> {
        let families = families_for(family);
        if families.len() > netio.max_endpoints {
            return Err(BindError::TooManyEndpoints {
                requested: families.len(),
                max: netio.max_endpoints,
            });
        }

        let local_mac = nic
            .local_mac_addr()
            .unwrap_or_else(|| queue.device.mac_addr());
        let local_ips = bind_addr
            .into_iter()
            .chain(nic.local_ips.iter().copied())
            .collect();

        let mut transport = Self {
            queue,
            endpoints: EndpointSet::new(Vec::new(), netio.max_endpoints),
            local_mac,
            peer_mac: nic.peer_mac_addr(),
            local_ips,
            next_ephemeral: EPHEMERAL_PORT_START,
            rx: Vec::with_capacity(nic.rx_burst),
            rx_burst: nic.rx_burst.max(1),
            spin_polls: nic.spin_polls,
            idle_sleep: Duration::from_micros(nic.idle_sleep_us),
        };

        // Every family shares the same port, as with kernel sockets.
        let port = if port == 0 {
            transport.allocate_port()?
        } else {
            port
        };
        for &af in families {
            if transport.endpoints.push(NicEndpoint::new(af, port)).is_err() {
                return Err(BindError::TooManyEndpoints {
                    requested: families.len(),
                    max: netio.max_endpoints,
                });
            }
        }

        tracing::debug!(
            port_id = transport.queue.port_id(),
            queue = transport.queue.queue,
            port,
            endpoints = transport.endpoints.len(),
            "NIC endpoints opened"
        );
        Ok(transport)
    }

    pub fn queue(&self) -> &NicQueue {
        &self.queue
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.endpoints
            .iter()
            .any(|ep| ep.is_open() && ep.local_port() == port)
    }

    /// Next free port of the dynamic range.
    fn allocate_port(&mut self) -> Result<u16, BindError> {
        let span = (u16::MAX - EPHEMERAL_PORT_START) as usize + 1;
        for _ in 0..span {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(BindError::PortsExhausted {
            queue: self.queue.queue,
        })
    }

    fn source_ip(&self, meta: &SendMeta) -> Option<IpAddr> {
        if let Some(local) = meta.local.filter(|a| !a.ip().is_unspecified()) {
            return Some(local.ip());
        }
        self.local_ips
            .iter()
            .copied()
            .find(|ip| ip.is_ipv4() == meta.peer.is_ipv4())
    }

    fn endpoint_for(&self, dst: &SocketAddr) -> Option<usize> {
        let family = AddressFamily::of(dst);
        self.endpoints
            .iter()
            .position(|ep| ep.is_open() && ep.family() == family && ep.local_port() == dst.port())
    }

    /// Hand every frame in `self.rx` upstream and release the buffers.
    fn deliver(&mut self, on_datagram: &mut dyn FnMut(Datagram<'_>)) -> RecvSummary {
        let mut summary = RecvSummary::default();
        let mut dropped = 0;

        for frame in &self.rx {
            let Some(parsed) = parse_udp_frame(frame) else {
                dropped += 1;
                continue;
            };
            let Some(endpoint) = self.endpoint_for(&parsed.dst) else {
                dropped += 1;
                continue;
            };
            let payload = &frame[parsed.payload.clone()];
            summary.add(payload.len());
            on_datagram(Datagram {
                endpoint,
                peer: parsed.src,
                local_ip: Some(parsed.dst.ip()),
                if_index: 0,
                ecn: parsed.ecn,
                payload,
            });
        }
        self.rx.clear();

        if dropped > 0 {
            tracing::trace!(queue = self.queue.queue, dropped, "Frames dropped on receive");
            record_metric(MetricsEvent::FramesDropped { count: dropped });
        }
        summary
    }

    /// Build one frame around `payload` and stage it.
    fn stage(&mut self, src: SocketAddr, meta: &SendMeta, payload: &[u8]) -> io::Result<()> {
        let mut buf = self
            .queue
            .pool
            .acquire()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOBUFS))?;
        let header = FrameHeader {
            src_mac: self.local_mac,
            dst_mac: self.peer_mac,
            src,
            dst: meta.peer,
            ecn: Ecn::NotEct,
        };
        let len = build_udp_frame(buf.room_mut(), &header, payload).map_err(|e| match e {
            FrameError::BufferTooSmall { .. } | FrameError::PayloadTooLarge(_) => {
                io::Error::from_raw_os_error(libc::EMSGSIZE)
            }
            FrameError::FamilyMismatch => io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        buf.set_len(len);

        let dropped = self
            .queue
            .staging
            .push(self.queue.device.as_ref(), self.queue.queue, buf);
        if dropped > 0 {
            record_metric(MetricsEvent::FramesDropped { count: dropped });
        }
        Ok(())
    }
}

impl Transport for NicQueueTransport {
    type Endpoint = NicEndpoint;

    fn endpoints(&self) -> &EndpointSet<NicEndpoint> {
        &self.endpoints
    }

    fn endpoints_mut(&mut self) -> &mut EndpointSet<NicEndpoint> {
        &mut self.endpoints
    }

    fn open_endpoint(&mut self, family: AddressFamily, port: u16) -> Result<NicEndpoint, BindError> {
        let port = if port == 0 {
            self.allocate_port()?
        } else {
            port
        };
        Ok(NicEndpoint::new(family, port))
    }

    fn receive(
        &mut self,
        timeout: Duration,
        on_datagram: &mut dyn FnMut(Datagram<'_>),
    ) -> io::Result<RecvSummary> {
        let deadline = Instant::now() + timeout;
        let mut empty_polls = 0u32;

        loop {
            let received = self
                .queue
                .device
                .rx_burst(self.queue.queue, &mut self.rx, self.rx_burst);
            if received > 0 {
                let pool = &self.queue.pool;
                record_metric(MetricsEvent::BufferPoolUtilization {
                    used: pool.in_use(),
                    total: pool.capacity(),
                });
                let summary = self.deliver(on_datagram);
                if !summary.is_empty() {
                    return Ok(summary);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(RecvSummary::default());
            }
            if empty_polls < self.spin_polls {
                empty_polls += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.idle_sleep.min(deadline - now));
            }
        }
    }

    fn send(&mut self, endpoint: usize, payload: &[u8], meta: &SendMeta) -> io::Result<usize> {
        let port = self
            .endpoints
            .get(endpoint)
            .filter(|ep| ep.is_open())
            .map(Endpoint::local_port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint is closed"))?;
        let src_ip = self.source_ip(meta).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no local address for the peer address family",
            )
        })?;
        let src = SocketAddr::new(src_ip, port);

        let segment = meta.segment_size;
        if segment > 0 && segment < payload.len() {
            for chunk in payload.chunks(segment) {
                self.stage(src, meta, chunk)?;
            }
        } else {
            self.stage(src, meta, payload)?;
        }
        Ok(payload.len())
    }

    fn flush(&mut self) {
        let (sent, dropped) = self
            .queue
            .staging
            .flush(self.queue.device.as_ref(), self.queue.queue);
        if dropped > 0 {
            tracing::debug!(queue = self.queue.queue, sent, dropped, "TX burst incomplete");
            record_metric(MetricsEvent::FramesDropped { count: dropped });
        }
    }

    /// Coalesced buffers are split into one frame per segment here.
    fn supports_gso(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.flush();
        self.endpoints.close_all();
    }
}
