//! NIC port and queue provisioning.
//!
//! # Server mode
//!
//! One port with `queues` RX/TX queue pairs. All RX queues share one pool of
//! `max(single_queue_default, 8192 × queues)` buffers; each queue gets its own
//! TX staging buffer.
//!
//! # Client mode
//!
//! `queues` ports with one queue pair each, every port owning a private pool
//! and staging buffer.
//!
//! Port-level failures (info, configure, descriptor adjustment, shared pool,
//! start) are fatal. A failure confined to one queue or one client port skips
//! that unit; the caller sees how many units came up and applies its own
//! partial-fleet policy.

use super::config::NicConfig;
use super::pool::{shared_pool_size, single_queue_pool_size, PacketPool};
use super::{DeviceInfo, NicDevice, PortConf, TxStaging};
use crate::error::{ConfigError, DeviceError};
use std::sync::Arc;

/// Everything one worker needs to drive one queue.
pub struct NicQueue {
    pub device: Arc<dyn NicDevice>,
    pub queue: u16,
    pub pool: Arc<PacketPool>,
    pub staging: TxStaging,
}

impl NicQueue {
    #[inline]
    pub fn port_id(&self) -> u16 {
        self.device.port_id()
    }
}

impl std::fmt::Debug for NicQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NicQueue")
            .field("port", &self.device.port_id())
            .field("queue", &self.queue)
            .field("pool", &self.pool.name())
            .finish()
    }
}

/// A started port and the queues that came up on it.
pub struct ProvisionedPort {
    pub device: Arc<dyn NicDevice>,
    pub pool: Arc<PacketPool>,
    pub rx_descriptors: u16,
    pub tx_descriptors: u16,
    pub queues: Vec<NicQueue>,
}

impl ProvisionedPort {
    #[inline]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

/// Steps shared by both modes: read capabilities, configure `queues` queue
/// pairs (requesting fast-free TX when available) and clamp ring sizes.
fn prepare_port(
    device: &dyn NicDevice,
    queues: u16,
    config: &NicConfig,
) -> Result<(DeviceInfo, u16, u16), DeviceError> {
    let port = device.port_id();
    let info = device.info().map_err(|e| DeviceError::Info {
        port,
        reason: e.to_string(),
    })?;

    let conf = PortConf {
        rx_queues: queues,
        tx_queues: queues,
        fast_free_tx: info.fast_free_tx,
    };
    device.configure(&conf).map_err(|e| DeviceError::Configure {
        port,
        queues,
        reason: e.to_string(),
    })?;

    let (rx_desc, tx_desc) = device
        .adjust_descriptors(
            info.rx_desc.clamp(config.rx_descriptors),
            info.tx_desc.clamp(config.tx_descriptors),
        )
        .map_err(|e| DeviceError::Descriptors {
            port,
            reason: e.to_string(),
        })?;

    tracing::debug!(
        port,
        driver = %info.driver,
        queues,
        rx_desc,
        tx_desc,
        fast_free_tx = info.fast_free_tx,
        "Port configured"
    );

    Ok((info, rx_desc, tx_desc))
}

/// Set up RX/TX for one queue and allocate its staging buffer.
fn setup_queue(
    device: &Arc<dyn NicDevice>,
    queue: u16,
    rx_desc: u16,
    tx_desc: u16,
    pool: &Arc<PacketPool>,
    tx_burst: usize,
) -> Result<NicQueue, DeviceError> {
    let port = device.port_id();
    device
        .setup_rx_queue(queue, rx_desc, pool)
        .map_err(|e| DeviceError::QueueSetup {
            port,
            queue,
            direction: "rx",
            reason: e.to_string(),
        })?;
    device
        .setup_tx_queue(queue, tx_desc)
        .map_err(|e| DeviceError::QueueSetup {
            port,
            queue,
            direction: "tx",
            reason: e.to_string(),
        })?;
    let staging = TxStaging::with_burst(tx_burst).ok_or(DeviceError::Staging { queue })?;

    Ok(NicQueue {
        device: Arc::clone(device),
        queue,
        pool: Arc::clone(pool),
        staging,
    })
}

fn start_port(device: &dyn NicDevice) -> Result<(), DeviceError> {
    device.start().map_err(|e| DeviceError::Start {
        port: device.port_id(),
        reason: e.to_string(),
    })
}

/// Provision one port with `config.queues` queues sharing one receive pool.
pub fn provision_server(
    device: Arc<dyn NicDevice>,
    config: &NicConfig,
) -> Result<ProvisionedPort, DeviceError> {
    let port = device.port_id();
    let (_, rx_desc, tx_desc) = prepare_port(device.as_ref(), config.queues, config)?;

    let buffers = shared_pool_size(config.queues as usize, config.rx_burst);
    let name = format!("rx_pool_p{}", port);
    let pool = device
        .create_pool(&name, buffers, config.buf_size)
        .map_err(|e| DeviceError::Pool {
            name: name.clone(),
            buffers,
            reason: e.to_string(),
        })?;

    let mut queues = Vec::with_capacity(config.queues as usize);
    for queue in 0..config.queues {
        match setup_queue(&device, queue, rx_desc, tx_desc, &pool, config.tx_burst) {
            Ok(q) => queues.push(q),
            Err(e) => tracing::error!(port, queue, error = %e, "Queue skipped"),
        }
    }

    start_port(device.as_ref())?;

    tracing::info!(
        port,
        queues = queues.len(),
        requested = config.queues,
        pool_buffers = buffers,
        "NIC port started"
    );

    Ok(ProvisionedPort {
        device,
        pool,
        rx_descriptors: rx_desc,
        tx_descriptors: tx_desc,
        queues,
    })
}

/// Provision every client port with a single queue and a private pool.
///
/// Ports whose pool, staging buffer or queue setup fails are skipped.
pub fn provision_clients(
    devices: Vec<Arc<dyn NicDevice>>,
    config: &NicConfig,
) -> Result<Vec<ProvisionedPort>, DeviceError> {
    let mut ports = Vec::with_capacity(devices.len());

    for device in devices {
        let port = device.port_id();
        let (_, rx_desc, tx_desc) = prepare_port(device.as_ref(), 1, config)?;

        let buffers = single_queue_pool_size(config.rx_burst);
        let name = format!("rx_pool_p{}", port);
        let pool = match device.create_pool(&name, buffers, config.buf_size) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(port, pool = %name, buffers, error = %e, "Port skipped: pool creation failed");
                continue;
            }
        };

        let queue = match setup_queue(&device, 0, rx_desc, tx_desc, &pool, config.tx_burst) {
            Ok(q) => q,
            Err(e) => {
                tracing::error!(port, error = %e, "Port skipped");
                continue;
            }
        };

        start_port(device.as_ref())?;
        tracing::info!(port, pool_buffers = buffers, "NIC client port started");

        ports.push(ProvisionedPort {
            device,
            pool,
            rx_descriptors: rx_desc,
            tx_descriptors: tx_desc,
            queues: vec![queue],
        });
    }

    if ports.is_empty() {
        return Err(DeviceError::NoPorts);
    }
    Ok(ports)
}

/// Every queue must be served by exactly one worker.
pub fn check_workers_match_queues(workers: usize, queues: usize) -> Result<(), ConfigError> {
    if workers != queues {
        return Err(ConfigError::WorkerQueueMismatch { workers, queues });
    }
    Ok(())
}

/// Apply the partial-fleet policy to a provisioning result.
pub fn check_fleet(
    provisioned: usize,
    requested: usize,
    require_all: bool,
) -> Result<(), ConfigError> {
    if provisioned < requested {
        if require_all {
            return Err(ConfigError::PartialFleet {
                provisioned,
                requested,
            });
        }
        tracing::warn!(provisioned, requested, "Continuing with a partial NIC fleet");
    }
    Ok(())
}
