//! Kernel socket transport.
//!
//! Waits with poll(2) across every open endpoint, then drains each readable
//! socket with non-blocking recvmsg up to the configured burst. Received
//! bytes land in one worker-local buffer that is reused for every datagram;
//! the payload handed upstream is only valid inside the callback.

use super::transport::{Datagram, RecvSummary, Transport};
use crate::error::BindError;
use crate::netio::config::{gso_available, DEFAULT_RECV_BUFFER_SIZE};
use crate::netio::{
    open_endpoint, open_endpoints, recv_msg, send_msg, AddressFamily, EndpointSet, NetIoConfig,
    SendMeta, SocketEndpoint, SocketOptions,
};
use crate::telemetry::{record_metric, MetricsEvent};
use std::io;
use std::time::Duration;

pub struct SocketTransport {
    endpoints: EndpointSet<SocketEndpoint>,
    options: SocketOptions,
    gso: bool,
    recv_burst: usize,
    recv_buf: Vec<u8>,
    pollfds: Vec<libc::pollfd>,
    /// Endpoint index of each entry in `pollfds`.
    poll_index: Vec<usize>,
}

impl SocketTransport {
    /// Open the worker's endpoints on `port` for `family`.
    pub fn open(port: u16, family: AddressFamily, config: &NetIoConfig) -> Result<Self, BindError> {
        let options = SocketOptions {
            buffer_size: config.socket_buffer_size,
            reuse_port: config.reuse_port,
        };
        let endpoints = open_endpoints(port, family, config.max_endpoints, &options)?;
        Ok(Self::new(
            EndpointSet::new(endpoints, config.max_endpoints),
            options,
            config.recv_burst,
            gso_available() && !config.disable_gso,
        ))
    }

    pub fn new(
        endpoints: EndpointSet<SocketEndpoint>,
        options: SocketOptions,
        recv_burst: usize,
        gso: bool,
    ) -> Self {
        Self {
            endpoints,
            options,
            gso,
            recv_burst: recv_burst.max(1),
            recv_buf: vec![0u8; DEFAULT_RECV_BUFFER_SIZE],
            pollfds: Vec::new(),
            poll_index: Vec::new(),
        }
    }

    fn rebuild_pollfds(&mut self) {
        self.pollfds.clear();
        self.poll_index.clear();
        for (index, ep) in self.endpoints.iter().enumerate() {
            if let Some(fd) = ep.raw_fd() {
                self.pollfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                self.poll_index.push(index);
            }
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("endpoints", &self.endpoints)
            .field("gso", &self.gso)
            .field("recv_burst", &self.recv_burst)
            .finish()
    }
}

/// poll(2) timeout in milliseconds, rounded up so short delays still block.
fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    if timeout.is_zero() {
        return 0;
    }
    let ms = timeout.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl Transport for SocketTransport {
    type Endpoint = SocketEndpoint;

    fn endpoints(&self) -> &EndpointSet<SocketEndpoint> {
        &self.endpoints
    }

    fn endpoints_mut(&mut self) -> &mut EndpointSet<SocketEndpoint> {
        &mut self.endpoints
    }

    fn open_endpoint(
        &mut self,
        family: AddressFamily,
        port: u16,
    ) -> Result<SocketEndpoint, BindError> {
        open_endpoint(port, family, &self.options)
    }

    fn receive(
        &mut self,
        timeout: Duration,
        on_datagram: &mut dyn FnMut(Datagram<'_>),
    ) -> io::Result<RecvSummary> {
        self.rebuild_pollfds();
        if self.pollfds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(RecvSummary::default());
        }

        // SAFETY: pollfds is a live, correctly sized array of pollfd.
        let ready = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                poll_timeout_ms(timeout),
            )
        };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut summary = RecvSummary::default();
        let mut first_error = None;
        if ready == 0 {
            return Ok(summary);
        }

        for (slot, pfd) in self.pollfds.iter().enumerate() {
            if pfd.revents & (libc::POLLIN | libc::POLLERR) == 0 {
                continue;
            }
            let endpoint = self.poll_index[slot];
            for _ in 0..self.recv_burst {
                match recv_msg(pfd.fd, &mut self.recv_buf) {
                    Ok(meta) if meta.truncated => {
                        tracing::debug!(
                            endpoint,
                            peer = %meta.peer,
                            buffer = self.recv_buf.len(),
                            "Dropping truncated datagram"
                        );
                        record_metric(MetricsEvent::NetworkReceiveError);
                    }
                    Ok(meta) => {
                        summary.add(meta.len);
                        on_datagram(Datagram {
                            endpoint,
                            peer: meta.peer,
                            local_ip: meta.local_ip,
                            if_index: meta.if_index,
                            ecn: meta.ecn,
                            payload: &self.recv_buf[..meta.len],
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(endpoint, error = %e, "recvmsg failed");
                        first_error.get_or_insert(e);
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) if summary.is_empty() => Err(e),
            _ => Ok(summary),
        }
    }

    fn send(&mut self, endpoint: usize, payload: &[u8], meta: &SendMeta) -> io::Result<usize> {
        let fd = self
            .endpoints
            .get(endpoint)
            .and_then(SocketEndpoint::raw_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint is closed"))?;
        send_msg(fd, payload, meta)
    }

    fn supports_gso(&self) -> bool {
        self.gso
    }
}
