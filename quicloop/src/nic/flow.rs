//! Destination-address flow steering.
//!
//! Each queue is served by exactly one worker, so the device must deliver a
//! connection's traffic to the same queue every time. One rule per queue
//! matches any Ethernet frame whose IP destination equals the queue's bind
//! address and directs it to that queue.

use super::NicDevice;
use std::net::IpAddr;

/// Match on the exact IP destination, act by queueing.
///
/// The Ethernet layer of the pattern is always "any".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub dst: IpAddr,
    pub queue: u16,
}

impl FlowRule {
    #[inline]
    pub fn matches(&self, dst: IpAddr) -> bool {
        self.dst == dst
    }
}

/// Bind address assigned to `queue` when `bind_addresses` are spread
/// round-robin across the queues.
#[inline]
pub fn bind_address_for(queue: u16, bind_addresses: &[IpAddr]) -> Option<IpAddr> {
    if bind_addresses.is_empty() {
        return None;
    }
    Some(bind_addresses[queue as usize % bind_addresses.len()])
}

/// Install one rule per queue. Each rule is validated first. A rule that
/// fails validation or creation is logged and skipped.
///
/// Returns the rules that were installed.
pub fn install_flow_rules(
    device: &dyn NicDevice,
    queue_count: u16,
    bind_addresses: &[IpAddr],
) -> Vec<FlowRule> {
    let port = device.port_id();
    let mut installed = Vec::with_capacity(queue_count as usize);

    for queue in 0..queue_count {
        let Some(dst) = bind_address_for(queue, bind_addresses) else {
            tracing::warn!(port, "No bind address, flow steering skipped");
            break;
        };
        let rule = FlowRule { dst, queue };

        if let Err(e) = device.validate_flow(&rule) {
            tracing::error!(port, queue, dst = %dst, error = %e, "Flow rule validation failed");
            continue;
        }
        if let Err(e) = device.create_flow(&rule) {
            tracing::error!(port, queue, dst = %dst, error = %e, "Flow rule creation failed");
            continue;
        }

        tracing::debug!(port, queue, dst = %dst, "Flow rule installed");
        installed.push(rule);
    }

    tracing::info!(
        port,
        installed = installed.len(),
        requested = queue_count,
        "Flow steering configured"
    );
    installed
}
