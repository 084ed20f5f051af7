//! Global engine configuration.
//!
//! Settings that apply to every worker: the UDP port and address family
//! the loops serve, the helper runtime, logging, the transport backend
//! and telemetry.

use crate::netio::{AddressFamily, Backend, NetIoConfig};
use crate::nic::NicConfig;
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// Global engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Local port, family and outbound interface
    pub network: NetworkConfig,

    /// Helper tokio runtime (signals, telemetry)
    pub runtime: RuntimeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Packet loop workers and the socket backend
    pub netio: NetIoConfig,

    /// Kernel-bypass NIC backend
    pub nic: NicConfig,

    /// Telemetry configuration
    pub telemetry: TelemetryConfig,
}

impl GlobalConfig {
    /// Validate global configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.network.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.runtime.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.netio.validate() {
            errors.extend(e);
        }

        // NIC settings only matter when that backend is selected.
        if self.netio.backend == Backend::Nic {
            if let Err(e) = self.nic.validate() {
                errors.extend(e);
            }
        }

        if let Err(e) = self.telemetry.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Where the packet loops listen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port to serve.
    ///
    /// `0` asks for an ephemeral port per worker (kernel-assigned for
    /// sockets, taken from the dynamic range for NIC queues).
    ///
    /// **Default:** `4443`
    pub port: u16,

    /// Address family: `unspec` opens one IPv4 and one IPv6 endpoint.
    ///
    /// **Default:** `unspec`
    pub family: AddressFamily,

    /// Outbound interface index used when the engine does not pick one.
    ///
    /// **Default:** `0` (routing table decides)
    pub dest_if: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 4443,
            family: AddressFamily::Unspec,
            dest_if: 0,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.port == 0 {
            tracing::warn!("network.port=0 binds every worker to an ephemeral port");
        }
        Ok(())
    }
}

/// Runtime configuration for the helper tokio runtime.
///
/// Packet loops never run on it; it hosts the signal handler and the
/// metrics task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// **Default:** 2
    pub worker_threads: usize,

    /// **Default:** 16
    pub max_blocking_threads: usize,

    /// **Default:** `"quicloop-rt"`
    pub thread_name: String,

    /// Stack size for each thread in bytes.
    ///
    /// **Default:** 2 MB
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(1, 2),
            max_blocking_threads: 16,
            thread_name: "quicloop-rt".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker_threads == 0 {
            errors.push("runtime.worker_threads must be > 0".to_string());
        }

        if self.worker_threads > 1024 {
            errors.push("runtime.worker_threads is unreasonably high (> 1024)".to_string());
        }

        if self.max_blocking_threads == 0 {
            errors.push("runtime.max_blocking_threads must be > 0".to_string());
        }

        if self.thread_stack_size < 128 * 1024 {
            errors.push("runtime.thread_stack_size too small (< 128 KB)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level; `RUST_LOG` takes precedence when set.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,

    /// Emit JSON lines instead of human-readable text.
    ///
    /// **Default:** `false`
    pub json_format: bool,

    /// **Default:** `true`
    pub enable_colors: bool,

    /// Include source file and line number in logs.
    ///
    /// **Default:** `false`
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            enable_colors: true,
            include_file_line: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}
