//! Event-driven metrics collection for the packet loop
//!
//! Workers record fire-and-forget events over an unbounded channel. A tokio
//! task drains the channel into atomic counters and logs a summary at the
//! configured interval.

use anyhow::Result;
use crossbeam_channel::{self, Receiver, Sender};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::config::TelemetryConfig;

/// Global metrics event sender
static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Aggregated counters, reachable for snapshots once the task is started
static METRICS_COLLECTOR: OnceCell<Arc<MetricsCollector>> = OnceCell::new();

/// Metrics events for fire-and-forget recording
///
/// Plain `Copy` payloads only, so recording never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsEvent {
    /// Datagram delivered to the protocol engine
    PacketReceived { bytes: usize },

    /// Datagram accepted by the transport
    PacketSent { bytes: usize },

    /// Waiting for or reading datagrams failed
    NetworkReceiveError,

    /// A send failed and was not recovered
    NetworkSendError,

    /// Send failed because the destination is unreachable
    DestinationUnreachable,

    /// An oversized send was split and resent in `chunks` pieces
    ChunkedResend { chunks: usize },

    /// Snapshot of a NIC pool's utilization
    BufferPoolUtilization { used: usize, total: usize },

    /// Frames dropped (pool empty, malformed, or refused by the device)
    FramesDropped { count: usize },

    /// Time a worker spent waiting for traffic
    IdleTime { micros: u64 },

    /// A wait overshot its requested delay
    WakeOverrun,

    /// A migration test replaced or added an endpoint
    MigrationTest { nat: bool },

    WorkerStarted,

    WorkerStopped,
}

pub struct MetricsHandle {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsHandle {
    pub fn disabled() -> Self {
        Self {
            task_handle: None,
            shutdown_tx: None,
        }
    }

    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Err(e)) => tracing::error!(error = ?e, "Metrics task panicked during shutdown"),
                Ok(Ok(())) => {}
                Err(_) => tracing::error!("Metrics task shutdown timed out after 5 seconds"),
            }
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub receive_errors: u64,
    pub send_errors: u64,
    pub unreachable: u64,
    pub chunked_resends: u64,
    pub resent_chunks: u64,
    pub pool_used: u64,
    pub pool_total: u64,
    pub frames_dropped: u64,
    pub idle_micros: u64,
    pub wake_overruns: u64,
    pub nat_tests: u64,
    pub migration_tests: u64,
    pub active_workers: u64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    receive_errors: AtomicU64,
    send_errors: AtomicU64,
    unreachable: AtomicU64,
    chunked_resends: AtomicU64,
    resent_chunks: AtomicU64,
    pool_used: AtomicU64,
    pool_total: AtomicU64,
    frames_dropped: AtomicU64,
    idle_micros: AtomicU64,
    wake_overruns: AtomicU64,
    nat_tests: AtomicU64,
    migration_tests: AtomicU64,
    active_workers: AtomicU64,
}

impl MetricsCollector {
    pub fn process_event(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::PacketReceived { bytes } => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            MetricsEvent::PacketSent { bytes } => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            MetricsEvent::NetworkReceiveError => {
                self.receive_errors.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::NetworkSendError => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::DestinationUnreachable => {
                self.unreachable.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::ChunkedResend { chunks } => {
                self.chunked_resends.fetch_add(1, Ordering::Relaxed);
                self.resent_chunks.fetch_add(chunks as u64, Ordering::Relaxed);
            }
            MetricsEvent::BufferPoolUtilization { used, total } => {
                self.pool_used.store(used as u64, Ordering::Relaxed);
                self.pool_total.store(total as u64, Ordering::Relaxed);
            }
            MetricsEvent::FramesDropped { count } => {
                self.frames_dropped.fetch_add(count as u64, Ordering::Relaxed);
            }
            MetricsEvent::IdleTime { micros } => {
                self.idle_micros.fetch_add(micros, Ordering::Relaxed);
            }
            MetricsEvent::WakeOverrun => {
                self.wake_overruns.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::MigrationTest { nat: true } => {
                self.nat_tests.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::MigrationTest { nat: false } => {
                self.migration_tests.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::WorkerStarted => {
                self.active_workers.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::WorkerStopped => {
                // Saturating: a stop without a matching start must not wrap.
                let _ = self
                    .active_workers
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                        Some(v.saturating_sub(1))
                    });
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets_received: load(&self.packets_received),
            packets_sent: load(&self.packets_sent),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
            receive_errors: load(&self.receive_errors),
            send_errors: load(&self.send_errors),
            unreachable: load(&self.unreachable),
            chunked_resends: load(&self.chunked_resends),
            resent_chunks: load(&self.resent_chunks),
            pool_used: load(&self.pool_used),
            pool_total: load(&self.pool_total),
            frames_dropped: load(&self.frames_dropped),
            idle_micros: load(&self.idle_micros),
            wake_overruns: load(&self.wake_overruns),
            nat_tests: load(&self.nat_tests),
            migration_tests: load(&self.migration_tests),
            active_workers: load(&self.active_workers),
        }
    }

    fn drain(&self, rx: &Receiver<MetricsEvent>, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            match rx.try_recv() {
                Ok(event) => {
                    self.process_event(event);
                    processed += 1;
                }
                Err(_) => break,
            }
        }
        processed
    }
}

fn log_report(service: &str, s: &MetricsSnapshot) {
    tracing::info!(
        service = %service,
        rx_packets = s.packets_received,
        rx_bytes = s.bytes_received,
        tx_packets = s.packets_sent,
        tx_bytes = s.bytes_sent,
        rx_errors = s.receive_errors,
        tx_errors = s.send_errors,
        unreachable = s.unreachable,
        chunked_resends = s.chunked_resends,
        frames_dropped = s.frames_dropped,
        pool_used = s.pool_used,
        pool_total = s.pool_total,
        idle_ms = s.idle_micros / 1000,
        wake_overruns = s.wake_overruns,
        workers = s.active_workers,
        "Packet loop metrics"
    );
}

/// Record a metric event (fire-and-forget)
///
/// Safe to call from any worker thread; a no-op until the metrics task is
/// started.
#[inline]
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        // Unbounded channel: never blocks, ignore a disconnected receiver
        let _ = sender.send(event);
    }
}

/// Current counter values, or `None` when metrics were never started.
pub fn metrics_snapshot() -> Option<MetricsSnapshot> {
    METRICS_COLLECTOR.get().map(|c| c.snapshot())
}

/// Start the metrics aggregation task on the given runtime.
///
/// Can only succeed once per process.
pub async fn start_metrics_task(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    let (tx, rx) = crossbeam_channel::unbounded::<MetricsEvent>();

    METRICS_SENDER
        .set(tx)
        .map_err(|_| anyhow::anyhow!("Metrics sender already initialized"))?;

    let collector = Arc::clone(METRICS_COLLECTOR.get_or_init(Default::default));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    let service = config.service_name.clone();
    let report_every = Duration::from_secs(config.report_interval_secs.max(1));

    let task_handle = runtime_handle.spawn(async move {
        tracing::info!("Metrics collection task started");
        let mut report = tokio::time::interval(report_every);
        report.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    collector.drain(&rx, usize::MAX);
                    log_report(&service, &collector.snapshot());
                    tracing::info!("Metrics task shutting down");
                    break;
                }
                _ = report.tick() => {
                    collector.drain(&rx, usize::MAX);
                    log_report(&service, &collector.snapshot());
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    // Bounded batch per wakeup keeps the select responsive.
                    while collector.drain(&rx, 1000) == 1000 {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    });

    Ok(MetricsHandle {
        task_handle: Some(task_handle),
        shutdown_tx: Some(shutdown_tx),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_aggregates_events() {
        let collector = MetricsCollector::default();
        collector.process_event(MetricsEvent::PacketReceived { bytes: 100 });
        collector.process_event(MetricsEvent::PacketReceived { bytes: 50 });
        collector.process_event(MetricsEvent::ChunkedResend { chunks: 3 });
        collector.process_event(MetricsEvent::MigrationTest { nat: true });
        collector.process_event(MetricsEvent::WakeOverrun);

        let s = collector.snapshot();
        assert_eq!(s.packets_received, 2);
        assert_eq!(s.bytes_received, 150);
        assert_eq!(s.chunked_resends, 1);
        assert_eq!(s.resent_chunks, 3);
        assert_eq!(s.nat_tests, 1);
        assert_eq!(s.migration_tests, 0);
        assert_eq!(s.wake_overruns, 1);
    }

    #[test]
    fn test_worker_gauge_does_not_underflow() {
        let collector = MetricsCollector::default();
        collector.process_event(MetricsEvent::WorkerStopped);
        assert_eq!(collector.snapshot().active_workers, 0);
        collector.process_event(MetricsEvent::WorkerStarted);
        assert_eq!(collector.snapshot().active_workers, 1);
    }

    #[test]
    fn test_pool_utilization_is_a_gauge() {
        let collector = MetricsCollector::default();
        collector.process_event(MetricsEvent::BufferPoolUtilization { used: 10, total: 64 });
        collector.process_event(MetricsEvent::BufferPoolUtilization { used: 4, total: 64 });
        let s = collector.snapshot();
        assert_eq!((s.pool_used, s.pool_total), (4, 64));
    }

    #[test]
    fn test_drain_respects_limit() {
        let collector = MetricsCollector::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..5 {
            tx.send(MetricsEvent::NetworkSendError).unwrap();
        }
        assert_eq!(collector.drain(&rx, 3), 3);
        assert_eq!(collector.drain(&rx, 10), 2);
        assert_eq!(collector.snapshot().send_errors, 5);
    }
}
