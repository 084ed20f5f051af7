//! Cross-section configuration checks.
//!
//! Each section validates its own fields; the rules here involve more than
//! one section.

use super::ServerConfig;
use crate::netio::{AddressFamily, Backend};
use crate::nic::NicMode;

/// Rules spanning several sections. Hard errors are returned; questionable
/// but workable combinations are logged.
pub fn validate_cross_checks(config: &ServerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let global = &config.global;
    let netio = &global.netio;

    let primary = match global.network.family {
        AddressFamily::Unspec => 2,
        _ => 1,
    };
    if primary >= netio.max_endpoints {
        tracing::warn!(
            family = global.network.family.name(),
            max_endpoints = netio.max_endpoints,
            "No room for a migration candidate endpoint; migration tests will be refused"
        );
    }

    if netio.backend == Backend::Nic {
        let nic = &global.nic;
        if netio.workers != nic.queues as usize {
            errors.push(format!(
                "netio.workers ({}) must equal nic.queues ({}): every queue needs exactly one worker",
                netio.workers, nic.queues
            ));
        }
        if nic.mode == NicMode::Client && nic.flow_steering {
            tracing::warn!("nic.flow_steering has no effect in client mode");
        }
        if nic.local_ips.is_empty() && nic.bind_addresses.is_empty() {
            tracing::warn!(
                "No nic.local_ips or nic.bind_addresses: datagrams without an engine-chosen source cannot be sent"
            );
        }
    } else if netio.workers > 1 && global.network.port != 0 && !netio.reuse_port {
        errors.push(format!(
            "netio.workers={} on fixed port {} requires netio.reuse_port",
            netio.workers, global.network.port
        ));
    }

    if global.runtime.worker_threads > num_cpus::get() * 4 {
        tracing::warn!(
            runtime_threads = global.runtime.worker_threads,
            "runtime.worker_threads is much larger than the CPU count"
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
