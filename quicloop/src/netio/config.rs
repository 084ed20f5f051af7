use serde::{Deserialize, Serialize};

/// Receive buffer size for the socket backend.
/// Matches the largest datagram a QUIC endpoint accepts without GSO/GRO.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1536;

/// Send buffer size without segmentation offload.
pub const SEND_BUFFER_SIZE: usize = 1536;

/// Send buffer size when UDP GSO can batch several packets in one call.
pub const GSO_SEND_BUFFER_SIZE: usize = 0xFFFF;

/// Upper bound on endpoints per worker (primary sockets plus migration
/// candidates).
pub const DEFAULT_MAX_ENDPOINTS: usize = 4;

/// Longest a worker may block, whatever the engine asks for.
pub const DEFAULT_MAX_WAKE_DELAY_US: u64 = 10_000_000;

/// Transport backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kernel UDP sockets.
    #[default]
    Socket,
    /// Kernel-bypass NIC queues.
    Nic,
}

/// Address family preference for socket endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// One IPv4 and one IPv6 endpoint.
    #[default]
    Unspec,
    V4,
    V6,
}

impl AddressFamily {
    /// Family of a concrete socket address.
    #[inline]
    pub fn of(addr: &std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(_) => AddressFamily::V4,
            std::net::SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AddressFamily::Unspec => "unspec",
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        }
    }
}

impl std::str::FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unspec" | "any" | "" => Ok(AddressFamily::Unspec),
            "v4" | "ipv4" | "4" => Ok(AddressFamily::V4),
            "v6" | "ipv6" | "6" => Ok(AddressFamily::V6),
            _ => Err(format!("Invalid address family: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// Transport backend used by every worker.
    pub backend: Backend,

    /// Number of packet loop workers to spawn.
    /// Each worker is a native OS thread with its own endpoints and loop state.
    /// With the NIC backend this must equal the number of queues.
    pub workers: usize,

    /// Pin each worker thread to a specific CPU core for cache locality.
    pub pin_to_cpu: bool,

    /// Enable SO_REUSEPORT so several workers can share one fixed UDP port.
    pub reuse_port: bool,

    /// Optional kernel buffer size applied to both SO_SNDBUF and SO_RCVBUF.
    /// Failing to apply it is logged, not fatal.
    pub socket_buffer_size: Option<usize>,

    /// Never use UDP GSO, even where the kernel supports it.
    pub disable_gso: bool,

    /// Maximum endpoints a worker may hold (migration tests add one).
    pub max_endpoints: usize,

    /// Maximum datagrams drained from one socket per readiness wakeup.
    pub recv_burst: usize,

    /// Ceiling for the engine's wake delay, in microseconds.
    pub max_wake_delay_us: u64,
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Socket,
            workers: 1,
            pin_to_cpu: false,
            reuse_port: true,
            socket_buffer_size: None,
            disable_gso: false,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            recv_burst: 32,
            max_wake_delay_us: DEFAULT_MAX_WAKE_DELAY_US,
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers == 0 {
            errors.push("netio.workers must be at least 1".to_string());
        }

        if self.max_endpoints < 2 {
            errors.push(
                "netio.max_endpoints must be at least 2 (IPv4 and IPv6 endpoints)".to_string(),
            );
        }

        if self.recv_burst == 0 {
            errors.push("netio.recv_burst must be > 0".to_string());
        }

        if self.max_wake_delay_us == 0 {
            errors.push("netio.max_wake_delay_us must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Send buffer capacity for this platform and configuration.
    pub fn send_buffer_size(&self) -> usize {
        if gso_available() && !self.disable_gso {
            GSO_SEND_BUFFER_SIZE
        } else {
            SEND_BUFFER_SIZE
        }
    }
}

/// Whether the platform supports UDP segmentation offload.
#[inline]
pub fn gso_available() -> bool {
    cfg!(target_os = "linux")
}
