//! Engine configuration.
//!
//! Layered loading: defaults, then a TOML file, then `QUICLOOP_` environment
//! variables, then command-line flags.
//!
//! # Example
//!
//! ```toml
//! [global.network]
//! port = 4443
//! family = "unspec"
//!
//! [global.netio]
//! backend = "socket"
//! workers = 4
//! reuse_port = true
//!
//! [global.nic]
//! driver = "memory"
//! queues = 4
//! flow_steering = true
//! bind_addresses = ["10.0.0.1", "10.0.0.2"]
//! ```

pub mod global;
pub mod loader;
pub mod validation;

pub use global::{GlobalConfig, LogLevel, LoggingConfig, NetworkConfig, RuntimeConfig};
pub use loader::{load_config, load_config_from, CliArgs};
pub use validation::validate_cross_checks;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub global: GlobalConfig,
}

impl ServerConfig {
    /// Validate every section plus the cross-section rules.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.global.validate() {
            errors.extend(e);
        }

        if let Err(e) = validate_cross_checks(self) {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
