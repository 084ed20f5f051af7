//! Kernel-bypass NIC support.
//!
//! The poll-mode driver is an external capability expressed as the
//! [`NicDevice`] trait. Everything above it is ours:
//! - Port/queue provisioning with pool and descriptor sizing ([`provision`])
//! - Destination-address flow steering ([`flow`])
//! - Link-layer framing ([`frame`]) and packet buffers ([`pool`])
//! - An in-process software port for tests and dry runs ([`memory`])

pub mod config;
pub mod flow;
pub mod frame;
pub mod memory;
pub mod pool;
pub mod provision;

pub use config::{NicConfig, NicMode};
pub use flow::{install_flow_rules, FlowRule};
pub use frame::MacAddr;
pub use memory::MemoryPort;
pub use pool::{PacketBuf, PacketPool};
pub use provision::{
    check_fleet, check_workers_match_queues, provision_clients, provision_server, NicQueue,
    ProvisionedPort,
};

use std::sync::Arc;
use thiserror::Error;

/// Error reported by the device driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Descriptor ring limits advertised by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescLimits {
    pub min: u16,
    pub max: u16,
    /// Ring sizes must be a multiple of this.
    pub align: u16,
}

impl DescLimits {
    /// Clamp a requested ring size into the limits, rounding up to the
    /// alignment.
    pub fn clamp(&self, requested: u16) -> u16 {
        let align = self.align.max(1);
        let v = requested.clamp(self.min, self.max);
        let rounded = v.div_ceil(align) * align;
        if rounded > self.max {
            self.max - self.max % align
        } else {
            rounded
        }
    }
}

impl Default for DescLimits {
    fn default() -> Self {
        Self {
            min: 64,
            max: 4096,
            align: 32,
        }
    }
}

/// Capabilities read from the device before configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_desc: DescLimits,
    pub tx_desc: DescLimits,
    /// Device can free transmitted buffers without per-packet refcounting.
    pub fast_free_tx: bool,
}

/// Port-level configuration applied before queue setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub fast_free_tx: bool,
}

/// A multi-queue poll-mode NIC port.
///
/// Every method takes `&self`: the device is shared by the provisioner and
/// all workers of the port, each worker touching only its own queue.
pub trait NicDevice: Send + Sync {
    fn port_id(&self) -> u16;

    fn info(&self) -> Result<DeviceInfo, DriverError>;

    fn configure(&self, conf: &PortConf) -> Result<(), DriverError>;

    /// Apply the final ring sizes. Returns the sizes the device accepted.
    fn adjust_descriptors(&self, rx: u16, tx: u16) -> Result<(u16, u16), DriverError>;

    /// Create a packet pool for this port.
    fn create_pool(
        &self,
        name: &str,
        buffers: usize,
        buf_size: usize,
    ) -> Result<Arc<PacketPool>, DriverError> {
        PacketPool::new(name, buffers, buf_size)
            .ok_or_else(|| DriverError::new("pool must hold at least one buffer"))
    }

    fn setup_rx_queue(
        &self,
        queue: u16,
        descriptors: u16,
        pool: &Arc<PacketPool>,
    ) -> Result<(), DriverError>;

    fn setup_tx_queue(&self, queue: u16, descriptors: u16) -> Result<(), DriverError>;

    fn start(&self) -> Result<(), DriverError>;

    fn mac_addr(&self) -> MacAddr;

    /// Append up to `max` received frames to `out`. Returns the count.
    fn rx_burst(&self, queue: u16, out: &mut Vec<PacketBuf>, max: usize) -> usize;

    /// Transmit frames from the front of `frames`, removing the ones the
    /// device accepted. Returns the count sent.
    fn tx_burst(&self, queue: u16, frames: &mut Vec<PacketBuf>) -> usize;

    fn validate_flow(&self, rule: &FlowRule) -> Result<(), DriverError>;

    fn create_flow(&self, rule: &FlowRule) -> Result<(), DriverError>;
}

/// Per-queue TX staging buffer.
///
/// Frames accumulate until the burst size is reached or the caller flushes.
#[derive(Debug)]
pub struct TxStaging {
    frames: Vec<PacketBuf>,
    burst: usize,
}

impl TxStaging {
    /// Allocate a staging buffer for `burst` frames.
    pub fn with_burst(burst: usize) -> Option<Self> {
        let mut frames = Vec::new();
        frames.try_reserve_exact(burst).ok()?;
        Some(Self { frames, burst })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Stage a frame, flushing first when the buffer is full.
    ///
    /// Returns the number of frames dropped by that flush.
    pub fn push(&mut self, device: &dyn NicDevice, queue: u16, frame: PacketBuf) -> usize {
        let dropped = if self.frames.len() >= self.burst {
            self.flush(device, queue).1
        } else {
            0
        };
        self.frames.push(frame);
        dropped
    }

    /// Transmit everything staged. Returns `(sent, dropped)`; frames the
    /// device did not accept are released back to their pool.
    pub fn flush(&mut self, device: &dyn NicDevice, queue: u16) -> (usize, usize) {
        if self.frames.is_empty() {
            return (0, 0);
        }
        let sent = device.tx_burst(queue, &mut self.frames);
        let dropped = self.frames.len();
        self.frames.clear();
        (sent, dropped)
    }
}

#[cfg(test)]
mod tests;
