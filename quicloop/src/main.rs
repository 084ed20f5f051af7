use anyhow::Context;
use quicloop::config::{self, ServerConfig};
use quicloop::demo::EchoEngine;
use quicloop::netio::Backend;
use quicloop::nic::{self, MemoryPort, NicDevice, NicMode, ProvisionedPort};
use quicloop::worker::{self, NetIoHandle, WorkerId};
use quicloop::{runtime, telemetry};
use quicloop_x::NoCallback;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    telemetry::init_logging(&config.global.logging, &config.global.telemetry.service_name)
        .with_context(|| "failed to initialize logging")?;

    info!("Configuration loaded successfully");

    // Create tokio runtime for non-critical async tasks (signals, telemetry)
    let tokio_runtime = runtime::create_runtime(&config.global.runtime)
        .with_context(|| "failed to create tokio runtime")?;
    let runtime_handle = tokio_runtime.handle().clone();

    let metrics_handle = tokio_runtime.block_on(async {
        telemetry::init_telemetry(&config.global.telemetry, &runtime_handle)
            .await
            .with_context(|| "failed to initialize telemetry")
    })?;

    // Packet loops run on native threads, NOT on the tokio runtime
    let netio_handle = spawn_workers(&config).with_context(|| "failed to spawn packet loops")?;

    info!(
        port = config.global.network.port,
        backend = ?config.global.netio.backend,
        workers = netio_handle.worker_count(),
        "Packet loops started"
    );

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = Arc::clone(&shutdown_notify);

    tokio_runtime.spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Shutdown signal received");
        shutdown_notify_clone.notify_one();
    });

    tokio_runtime.block_on(async {
        shutdown_notify.notified().await;
    });

    info!("Initiating graceful shutdown");

    // Blocks until every worker has left its loop
    netio_handle.shutdown();

    tokio_runtime.block_on(async {
        metrics_handle.shutdown().await;
    });

    info!("Shutting down tokio runtime");
    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    info!("Shutdown complete");
    Ok(())
}

fn echo_factory(_worker: WorkerId) -> anyhow::Result<(EchoEngine, NoCallback)> {
    Ok((EchoEngine::default(), NoCallback))
}

fn spawn_workers(config: &ServerConfig) -> anyhow::Result<NetIoHandle> {
    let global = &config.global;

    match global.netio.backend {
        Backend::Socket => worker::spawn_socket_workers(&global.network, &global.netio, echo_factory),
        Backend::Nic => {
            let ports = provision_nic(config)?;
            worker::spawn_nic_workers(ports, &global.network, &global.netio, &global.nic, echo_factory)
        }
    }
}

/// Bring up the configured NIC ports and apply the partial-fleet policy.
fn provision_nic(config: &ServerConfig) -> anyhow::Result<Vec<ProvisionedPort>> {
    let nic_cfg = &config.global.nic;

    if nic_cfg.driver != "memory" {
        anyhow::bail!(
            "NIC driver '{}' is not available in this build (supported: memory)",
            nic_cfg.driver
        );
    }
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; hardware NIC drivers would need elevated privileges");
    }
    warn!("Using the in-memory NIC driver: frames are looped back on each queue");

    match nic_cfg.mode {
        NicMode::Server => {
            let device: Arc<dyn NicDevice> = Arc::new(
                MemoryPort::builder()
                    .max_queues(nic_cfg.queues)
                    .loopback(true)
                    .build(),
            );
            let port = nic::provision_server(Arc::clone(&device), nic_cfg)
                .with_context(|| "failed to provision NIC port")?;
            nic::check_fleet(port.queue_count(), nic_cfg.queues as usize, nic_cfg.require_all)?;

            if nic_cfg.flow_steering {
                nic::install_flow_rules(
                    device.as_ref(),
                    port.queue_count() as u16,
                    &nic_cfg.bind_addresses,
                );
            }
            Ok(vec![port])
        }
        NicMode::Client => {
            let devices: Vec<Arc<dyn NicDevice>> = (0..nic_cfg.queues)
                .map(|port_id| {
                    Arc::new(MemoryPort::builder().port_id(port_id).loopback(true).build())
                        as Arc<dyn NicDevice>
                })
                .collect();
            let ports = nic::provision_clients(devices, nic_cfg)
                .with_context(|| "failed to provision NIC client ports")?;
            nic::check_fleet(ports.len(), nic_cfg.queues as usize, nic_cfg.require_all)?;
            Ok(ports)
        }
    }
}
