//! Worker thread orchestration.
//!
//! Each worker is a native OS thread running one [`PacketLoop`] over its own
//! transport:
//! - **Socket backend**: its own endpoint set (SO_REUSEPORT when several
//!   workers share a port)
//! - **NIC backend**: exactly one RX/TX queue pair, fixed at provisioning
//! - **Own protocol engine and loop state** (nothing shared in the hot path)
//! - **CPU affinity pinning** when enabled
//!
//! Transports are opened on the spawning thread so that bind and
//! provisioning errors surface from [`spawn_socket_workers`] /
//! [`spawn_nic_workers`] instead of from inside a worker. Engines are built
//! on the worker thread and never cross threads.

pub mod migration;
pub mod nic_backend;
pub mod retry;
pub mod scheduler;
pub mod socket_backend;
pub mod transport;

pub use migration::MigrationState;
pub use nic_backend::{NicEndpoint, NicQueueTransport};
pub use scheduler::{LoopParams, LoopState, PacketLoop};
pub use socket_backend::SocketTransport;
pub use transport::{Datagram, RecvSummary, Transport};

use crate::config::global::NetworkConfig;
use crate::netio::NetIoConfig;
use crate::nic::flow::bind_address_for;
use crate::nic::{check_workers_match_queues, NicConfig, ProvisionedPort};
use crate::telemetry::{record_metric, MetricsEvent};
use anyhow::{Context, Result};
use quicloop_x::{LoopCallback, ProtocolEngine};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Stable identity of a worker within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NIC queue served by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAssignment {
    pub port: u16,
    pub queue: u16,
    pub worker: WorkerId,
    /// Destination address steered to this queue, if flow rules are used.
    pub bind_addr: Option<IpAddr>,
}

/// Registry entry for one worker.
#[derive(Debug)]
pub struct WorkerEntry {
    pub assignment: Option<QueueAssignment>,
    running: Arc<AtomicBool>,
}

impl WorkerEntry {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Every worker spawned by one call, keyed by [`WorkerId`].
///
/// Built once at spawn time; only the stop flags change afterwards.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    entries: BTreeMap<WorkerId, WorkerEntry>,
}

impl WorkerRegistry {
    /// Register a worker and return its stop flag (set while it should run).
    fn register(&mut self, id: WorkerId, assignment: Option<QueueAssignment>) -> Arc<AtomicBool> {
        let running = Arc::new(AtomicBool::new(true));
        self.entries.insert(
            id,
            WorkerEntry {
                assignment,
                running: Arc::clone(&running),
            },
        );
        running
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerEntry> {
        self.entries.get(&id)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &QueueAssignment> {
        self.entries.values().filter_map(|e| e.assignment.as_ref())
    }

    /// Clear the stop flag of one worker.
    pub fn stop(&self, id: WorkerId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.running.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for entry in self.entries.values() {
            entry.running.store(false, Ordering::Relaxed);
        }
    }
}

/// Handle for managing packet loop worker threads.
///
/// Dropping this handle will signal workers to stop.
pub struct NetIoHandle {
    registry: WorkerRegistry,
    threads: Vec<(WorkerId, JoinHandle<Result<()>>)>,
}

impl NetIoHandle {
    fn with_capacity(workers: usize) -> Self {
        Self {
            registry: WorkerRegistry::default(),
            threads: Vec::with_capacity(workers),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Wait for every worker to finish on its own and collect the results.
    pub fn join(mut self) -> Vec<(WorkerId, Result<()>)> {
        self.join_all()
    }

    /// Signal all workers to stop and wait for them to complete.
    pub fn shutdown(mut self) {
        info!("Shutting down packet loop workers");
        self.registry.stop_all();

        for (id, result) in self.join_all() {
            match result {
                Ok(()) => debug!(worker_id = id.0, "Worker thread exited cleanly"),
                Err(e) => error!(worker_id = id.0, error = ?e, "Worker thread returned error"),
            }
        }

        info!("Packet loop shutdown complete");
    }

    /// Stop and join the workers already started after a later one failed
    /// to start, then hand back the startup error.
    fn abort(mut self, err: anyhow::Error) -> anyhow::Error {
        warn!(
            started = self.threads.len(),
            error = %err,
            "Worker startup failed, stopping workers already running"
        );
        self.registry.stop_all();
        for (id, result) in self.join_all() {
            if let Err(e) = result {
                debug!(worker_id = id.0, error = ?e, "Aborted worker returned error");
            }
        }
        err
    }

    fn join_all(&mut self) -> Vec<(WorkerId, Result<()>)> {
        self.threads
            .drain(..)
            .map(|(id, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("worker {} panicked", id)));
                (id, result)
            })
            .collect()
    }
}

impl Drop for NetIoHandle {
    fn drop(&mut self) {
        debug!("NetIoHandle dropped, signaling shutdown");
        // Threads are not joined here; call shutdown() to wait for them.
        self.registry.stop_all();
    }
}

/// Builds the per-worker protocol engine and loop callback.
///
/// Called on the worker thread, so neither product has to be `Send`.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: ProtocolEngine;
    type Callback: LoopCallback;

    fn build(&self, worker: WorkerId) -> Result<(Self::Engine, Self::Callback)>;
}

impl<F, E, C> EngineFactory for F
where
    F: Fn(WorkerId) -> Result<(E, C)> + Send + Sync + 'static,
    E: ProtocolEngine,
    C: LoopCallback,
{
    type Engine = E;
    type Callback = C;

    fn build(&self, worker: WorkerId) -> Result<(E, C)> {
        self(worker)
    }
}

fn pin_current_thread(id: WorkerId) {
    match core_affinity::get_core_ids().and_then(|ids| ids.get(id.0).copied()) {
        Some(core_id) if core_affinity::set_for_current(core_id) => {
            info!(worker_id = id.0, core_id = core_id.id, "Worker thread pinned to CPU core");
        }
        _ => warn!(worker_id = id.0, "Failed to pin thread to CPU core"),
    }
}

/// Body of one worker thread.
fn run_worker<T, F>(
    id: WorkerId,
    transport: T,
    params: LoopParams,
    pin_to_cpu: bool,
    factory: Arc<F>,
    running: Arc<AtomicBool>,
) -> Result<()>
where
    T: Transport,
    F: EngineFactory,
{
    if pin_to_cpu {
        pin_current_thread(id);
    }
    record_metric(MetricsEvent::WorkerStarted);

    let result = factory
        .build(id)
        .with_context(|| format!("building protocol engine for worker {}", id))
        .and_then(|(mut engine, mut callback)| {
            PacketLoop::new(transport, &mut engine, &mut callback, params, running)
                .run()
                .with_context(|| format!("packet loop of worker {}", id))
        });

    record_metric(MetricsEvent::WorkerStopped);
    result
}

fn spawn_thread<T, F>(
    id: WorkerId,
    transport: T,
    params: LoopParams,
    pin_to_cpu: bool,
    factory: &Arc<F>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<()>>>
where
    T: Transport + Send + 'static,
    F: EngineFactory,
{
    let factory = Arc::clone(factory);
    thread::Builder::new()
        .name(format!("netio-{}", id))
        .spawn(move || run_worker(id, transport, params, pin_to_cpu, factory, running))
        .with_context(|| format!("spawning worker thread {}", id))
}

/// Spawn `netio.workers` socket-backed packet loops.
///
/// # Errors
///
/// Returns error if:
/// - Worker count is 0
/// - Any worker's endpoints cannot be opened
/// - Thread spawning fails
pub fn spawn_socket_workers<F>(
    network: &NetworkConfig,
    netio: &NetIoConfig,
    factory: F,
) -> Result<NetIoHandle>
where
    F: EngineFactory,
{
    if netio.workers == 0 {
        anyhow::bail!("netio workers must be at least 1");
    }
    if netio.workers > 1 && network.port != 0 && !netio.reuse_port {
        warn!(
            workers = netio.workers,
            port = network.port,
            "Several workers on one port without reuse_port; binding will fail"
        );
    }

    info!(
        workers = netio.workers,
        port = network.port,
        family = network.family.name(),
        pin_to_cpu = netio.pin_to_cpu,
        reuse_port = netio.reuse_port,
        "Starting socket packet loops"
    );

    let factory = Arc::new(factory);
    let mut handle = NetIoHandle::with_capacity(netio.workers);

    for n in 0..netio.workers {
        let id = WorkerId(n);
        let started = SocketTransport::open(network.port, network.family, netio)
            .with_context(|| format!("opening endpoints for worker {}", id))
            .and_then(|transport| {
                let params = LoopParams::new(n, netio, network.dest_if, transport.supports_gso());
                let running = handle.registry.register(id, None);
                spawn_thread(id, transport, params, netio.pin_to_cpu, &factory, running)
            });
        match started {
            Ok(thread) => handle.threads.push((id, thread)),
            Err(e) => return Err(handle.abort(e)),
        }
    }

    info!(workers = handle.threads.len(), "Socket packet loops started");
    Ok(handle)
}

/// Spawn one packet loop per provisioned NIC queue.
///
/// The number of queues must equal `netio.workers`.
pub fn spawn_nic_workers<F>(
    ports: Vec<ProvisionedPort>,
    network: &NetworkConfig,
    netio: &NetIoConfig,
    nic: &NicConfig,
    factory: F,
) -> Result<NetIoHandle>
where
    F: EngineFactory,
{
    let queue_count: usize = ports.iter().map(ProvisionedPort::queue_count).sum();
    check_workers_match_queues(netio.workers, queue_count)?;

    let factory = Arc::new(factory);
    let mut handle = NetIoHandle::with_capacity(queue_count);

    let queues = ports.into_iter().flat_map(|p| p.queues);
    for (n, queue) in queues.enumerate() {
        let id = WorkerId(n);
        let assignment = QueueAssignment {
            port: queue.port_id(),
            queue: queue.queue,
            worker: id,
            bind_addr: if nic.flow_steering {
                bind_address_for(queue.queue, &nic.bind_addresses)
            } else {
                None
            },
        };

        let started = NicQueueTransport::open(
            queue,
            network.port,
            network.family,
            assignment.bind_addr,
            nic,
            netio,
        )
        .with_context(|| format!("opening NIC endpoints for worker {}", id))
        .and_then(|transport| {
            let params = LoopParams::new(n, netio, network.dest_if, transport.supports_gso());
            debug!(
                worker_id = n,
                port = assignment.port,
                queue = assignment.queue,
                bind_addr = ?assignment.bind_addr,
                "Queue assigned"
            );
            let running = handle.registry.register(id, Some(assignment));
            spawn_thread(id, transport, params, netio.pin_to_cpu, &factory, running)
        });
        match started {
            Ok(thread) => handle.threads.push((id, thread)),
            Err(e) => return Err(handle.abort(e)),
        }
    }

    info!(workers = handle.threads.len(), "NIC packet loops started");
    Ok(handle)
}
