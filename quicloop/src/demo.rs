//! Built-in echo engine.
//!
//! Lets the binary and the integration tests drive a packet loop without a
//! QUIC stack: every received datagram is sent back to its sender from the
//! address it arrived on. Each distinct peer is tracked as one connection so
//! path probing and unreachable notifications have something to act on.

use quicloop_x::{ConnectionRef, PathAddrs, ProtocolEngine, RecvInfo, SendInfo, SendOutcome};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Payload sent on a freshly probed path.
pub const PROBE_PAYLOAD: &[u8] = b"quicloop-path-probe";

/// Default bound on queued replies.
pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Debug)]
struct Reply {
    payload: Vec<u8>,
    peer: SocketAddr,
    local: SocketAddr,
    if_index: u32,
    connection: ConnectionRef,
}

/// Echo engine with per-peer connection tracking.
#[derive(Debug)]
pub struct EchoEngine {
    connections: HashMap<SocketAddr, ConnectionRef>,
    paths: HashMap<ConnectionRef, PathAddrs>,
    pending: VecDeque<Reply>,
    max_pending: usize,
    next_connection: u64,
    echoed: u64,
    dropped: u64,
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl EchoEngine {
    pub fn new(max_pending: usize) -> Self {
        Self {
            connections: HashMap::new(),
            paths: HashMap::new(),
            pending: VecDeque::new(),
            max_pending,
            next_connection: 1,
            echoed: 0,
            dropped: 0,
        }
    }

    /// Datagrams handed back to the loop so far.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// Datagrams dropped because the queue was full or the reply did not fit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn connection_for(&mut self, peer: SocketAddr) -> ConnectionRef {
        if let Some(cnx) = self.connections.get(&peer) {
            return *cnx;
        }
        let cnx = ConnectionRef(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(peer, cnx);
        tracing::debug!(connection = cnx.0, %peer, "New echo peer");
        cnx
    }

    fn forget(&mut self, connection: ConnectionRef) {
        self.connections.retain(|_, c| *c != connection);
        self.paths.remove(&connection);
        self.pending.retain(|r| r.connection != connection);
    }
}

impl ProtocolEngine for EchoEngine {
    fn next_wake_delay(&mut self, _now: Instant, max_delay: Duration) -> Duration {
        if self.pending.is_empty() {
            max_delay
        } else {
            Duration::ZERO
        }
    }

    fn submit_received(
        &mut self,
        payload: &[u8],
        info: &RecvInfo,
        _now: Instant,
    ) -> Option<ConnectionRef> {
        let connection = self.connection_for(info.peer);
        self.paths
            .entry(connection)
            .or_insert(PathAddrs {
                peer: info.peer,
                local: info.local,
            });

        if self.pending.len() >= self.max_pending {
            self.dropped += 1;
            return Some(connection);
        }

        self.pending.push_back(Reply {
            payload: payload.to_vec(),
            peer: info.peer,
            local: info.local,
            if_index: info.if_index,
            connection,
        });
        Some(connection)
    }

    fn prepare_next_to_send(&mut self, _now: Instant, buf: &mut [u8]) -> SendOutcome {
        while let Some(reply) = self.pending.pop_front() {
            let len = reply.payload.len();
            let Some(dst) = buf.get_mut(..len) else {
                self.dropped += 1;
                continue;
            };
            dst.copy_from_slice(&reply.payload);
            self.echoed += 1;
            return SendOutcome::Datagram(SendInfo {
                len,
                peer: reply.peer,
                local: Some(reply.local),
                if_index: reply.if_index,
                connection: Some(reply.connection),
                segment_size: 0,
            });
        }
        SendOutcome::Idle
    }

    fn notify_destination_unreachable(
        &mut self,
        connection: ConnectionRef,
        _now: Instant,
        peer: SocketAddr,
        _local: Option<SocketAddr>,
        _if_index: u32,
        os_error: i32,
    ) {
        tracing::info!(connection = connection.0, %peer, os_error, "Echo peer unreachable");
        self.forget(connection);
    }

    fn primary_path(&self, connection: ConnectionRef) -> Option<PathAddrs> {
        self.paths.get(&connection).copied()
    }

    fn probe_new_path(
        &mut self,
        connection: ConnectionRef,
        peer: SocketAddr,
        local: SocketAddr,
        _now: Instant,
    ) -> quicloop_x::LoopSignal {
        tracing::info!(connection = connection.0, %peer, %local, "Probing new path");
        self.pending.push_back(Reply {
            payload: PROBE_PAYLOAD.to_vec(),
            peer,
            local,
            if_index: 0,
            connection,
        });
        quicloop_x::LoopSignal::Continue
    }
}
