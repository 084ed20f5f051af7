use serde::{Deserialize, Serialize};

/// Telemetry configuration.
///
/// Metrics are aggregated in-process and reported through the log at a fixed
/// interval.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to every report.
    pub service_name: String,

    /// Enable metrics aggregation (default: true).
    ///
    /// When disabled, `record_metric` is a no-op.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Interval between metrics reports in seconds (default: 60).
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_report_interval() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "quicloop".to_string(),
            enable_metrics: true,
            report_interval_secs: 60,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.service_name.is_empty() {
            errors.push("telemetry.service_name cannot be empty".to_string());
        }

        if self.enable_metrics && self.report_interval_secs == 0 {
            errors.push("telemetry.report_interval_secs must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
