//! # Telemetry and Observability
//!
//! Structured logging plus event-driven metrics for the packet loop.
//!
//! ## Architecture
//!
//! 1. **Hot path (workers)**: fire-and-forget [`record_metric`] over a channel
//! 2. **Metrics task**: a tokio task aggregates events into atomic counters
//!    and logs a report at a fixed interval
//! 3. **Logging**: `tracing` events; per-datagram detail only at `trace`
//!
//! ## Usage
//!
//! ```ignore
//! use quicloop::telemetry::{init_telemetry, record_metric, MetricsEvent};
//!
//! let metrics = init_telemetry(&config.global.telemetry, runtime.handle()).await?;
//! record_metric(MetricsEvent::PacketReceived { bytes: 1200 });
//! ```

pub mod config;
pub mod metrics;

pub use config::TelemetryConfig;
pub use metrics::{
    metrics_snapshot, record_metric, start_metrics_task, MetricsEvent, MetricsHandle,
    MetricsSnapshot,
};

use crate::config::global::LoggingConfig;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Start metrics aggregation when enabled.
pub async fn init_telemetry(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    let metrics_handle = if config.enable_metrics {
        tracing::info!(
            service = %config.service_name,
            interval_secs = config.report_interval_secs,
            "Starting event-driven metrics system"
        );
        start_metrics_task(config, runtime_handle).await?
    } else {
        tracing::warn!("Metrics collection is disabled");
        MetricsHandle::disabled()
    };

    tracing::info!("Telemetry system initialized");
    Ok(metrics_handle)
}

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig, service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_string()))?;

    let json_layer = config.json_format.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line)
    });

    let text_layer = (!config.json_format).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(config.enable_colors)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(service = %service_name, level = %config.level, "Logging initialized");
    Ok(())
}
