//! Address-migration test controller.
//!
//! Two test hooks let a harness exercise the protocol engine's path
//! handling without touching the network:
//!
//! - **NAT rebinding** (`SimulateNat`): the primary endpoint is replaced by a
//!   fresh one on a new ephemeral port. Peers now see traffic from a new
//!   source port, exactly as if a NAT had rebound the mapping.
//! - **Organized migration** (`SimulateMigration`): a candidate endpoint is
//!   appended and the engine is asked to probe a path from it. While the test
//!   is active, outbound datagrams whose source port is the candidate port
//!   leave through the candidate, and datagrams arriving on endpoint 0 are
//!   reported with the candidate port.

use super::transport::Transport;
use crate::netio::{loopback_addr, Endpoint, EndpointRole};
use crate::telemetry::{record_metric, MetricsEvent};
use quicloop_x::{ConnectionRef, LoopCallback, LoopEvent, LoopSignal, ProtocolEngine};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-worker organized-migration state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationState {
    testing: bool,
    next_port: u16,
}

impl MigrationState {
    #[inline]
    pub fn is_testing(&self) -> bool {
        self.testing
    }

    /// Port of the candidate endpoint (0 before any test).
    #[inline]
    pub fn next_port(&self) -> u16 {
        self.next_port
    }

    /// Local port reported upstream for a datagram that arrived on
    /// `endpoint`, whose bound port is `bound_port`.
    #[inline]
    pub fn receive_port(&self, endpoint: usize, bound_port: u16) -> u16 {
        if self.testing && endpoint == 0 {
            self.next_port
        } else {
            bound_port
        }
    }

    /// Endpoint forced for an outbound datagram with source `local`, if any.
    #[inline]
    pub fn send_override(&self, local: Option<SocketAddr>, endpoint_count: usize) -> Option<usize> {
        match local {
            Some(addr) if self.testing && endpoint_count > 0 && addr.port() == self.next_port => {
                Some(endpoint_count - 1)
            }
            _ => None,
        }
    }

    fn start(&mut self, port: u16) {
        self.testing = true;
        self.next_port = port;
    }
}

/// Run the migration test requested by `request`.
///
/// Returns the signal the loop continues with. `request` must be one of the
/// two migration sentinels; anything else is returned unchanged.
pub fn run_test<T, P, C>(
    request: LoopSignal,
    transport: &mut T,
    engine: &mut P,
    callback: &mut C,
    state: &mut MigrationState,
    last_connection: Option<ConnectionRef>,
    now: Instant,
) -> LoopSignal
where
    T: Transport,
    P: ProtocolEngine + ?Sized,
    C: LoopCallback + ?Sized,
{
    if !request.is_migration_test() {
        return request;
    }
    let Some(family) = transport.endpoints().primary_family() else {
        warn!(test = %request, "Migration test without a primary endpoint");
        return LoopSignal::Continue;
    };

    let mut candidate = match transport.open_endpoint(family, 0) {
        Ok(ep) => ep,
        Err(e) => {
            warn!(test = %request, error = %e, "Could not open endpoint for migration test");
            engine.log_app_message(
                last_connection,
                &format!("Could not create socket for migration test: {}", e),
            );
            return LoopSignal::Continue;
        }
    };
    let new_port = candidate.local_port();

    if request == LoopSignal::SimulateNat {
        let old_port = transport
            .endpoints_mut()
            .replace(0, candidate)
            .map(|old| old.local_port());
        info!(old_port = ?old_port, new_port, "Simulated NAT rebinding");
        record_metric(MetricsEvent::MigrationTest { nat: true });
        return callback.on_event(LoopEvent::PortUpdate(loopback_addr(family, new_port)));
    }

    let path = last_connection.and_then(|cnx| engine.primary_path(cnx).map(|p| (cnx, p)));
    let Some((cnx, path)) = path.filter(|_| !transport.endpoints().is_full()) else {
        debug!(
            new_port,
            endpoints = transport.endpoints().len(),
            has_connection = last_connection.is_some(),
            "Migration candidate discarded"
        );
        candidate.close();
        return LoopSignal::Continue;
    };

    candidate.set_role(EndpointRole::MigrationCandidate);
    if let Err(mut rejected) = transport.endpoints_mut().push(candidate) {
        rejected.close();
        return LoopSignal::Continue;
    }
    state.start(new_port);
    record_metric(MetricsEvent::MigrationTest { nat: false });

    let local = SocketAddr::new(path.local.ip(), new_port);
    info!(connection = cnx.0, peer = %path.peer, %local, "Probing migration path");
    engine.probe_new_path(cnx, path.peer, local, now)
}
