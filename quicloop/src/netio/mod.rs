//! Network I/O primitives for the socket backend.
//!
//! This module provides the kernel-facing pieces of the packet loop:
//! - Endpoint bookkeeping shared with the NIC backend
//! - UDP socket creation and configuration
//! - recvmsg/sendmsg with pktinfo, ECN and GSO ancillary data
//! - Network I/O configuration
//!
//! For worker thread orchestration, see the `worker` module.

pub mod config;
pub mod endpoint;
pub mod msg;
pub mod socket;

pub use config::{AddressFamily, Backend, NetIoConfig};
pub use endpoint::{Endpoint, EndpointRole, EndpointSet};
pub use msg::{recv_msg, send_msg, RecvMeta, SendMeta};
pub use socket::{loopback_addr, open_endpoint, open_endpoints, SocketEndpoint, SocketOptions};

#[cfg(test)]
mod tests;
