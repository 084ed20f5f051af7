//! quicloop-x: Protocol Bridge Interface for the quicloop packet engine
//!
//! This crate defines the fixed calling convention between the packet loop
//! (native worker threads moving datagrams over sockets or NIC queues) and a
//! QUIC protocol engine, which is treated as an opaque state machine.
//!
//! # Calling Convention
//!
//! The scheduler drives the engine through three calls, identical for every
//! transport backend:
//!
//! 1. [`ProtocolEngine::next_wake_delay`] - how long the loop may block
//! 2. [`ProtocolEngine::submit_received`] - hand over one received datagram
//! 3. [`ProtocolEngine::prepare_next_to_send`] - pull the next datagram, drained
//!    in a tight loop until it reports [`SendOutcome::Idle`]
//!
//! # Loop Signals
//!
//! Sentinels that used to be magic integers are expressed as [`LoopSignal`]
//! variants so the scheduler branches exhaustively. `SimulateNat` and
//! `SimulateMigration` hand control to the migration test controller instead
//! of terminating the loop.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Opaque reference to a connection inside the protocol engine.
///
/// The engine chooses the numbering; the loop only passes it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRef(pub u64);

/// Explicit Congestion Notification codepoint (RFC 3168).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Ecn {
    #[default]
    NotEct = 0b00,
    Ect1 = 0b01,
    Ect0 = 0b10,
    Ce = 0b11,
}

impl Ecn {
    /// Extract the codepoint from the low two bits of a TOS / traffic class byte.
    #[inline]
    pub fn from_tos(tos: u8) -> Self {
        match tos & 0b11 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Metadata reported upstream with every received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Remote address the datagram came from.
    pub peer: SocketAddr,
    /// Local address it was delivered to, with the bound port of the
    /// receiving endpoint.
    pub local: SocketAddr,
    /// Arrival interface index (0 when unknown).
    pub if_index: u32,
    /// ECN marking from the IP header.
    pub ecn: Ecn,
}

/// Description of a datagram the engine wrote into the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    /// Number of bytes written at the start of the send buffer.
    pub len: usize,
    /// Destination address.
    pub peer: SocketAddr,
    /// Source address to use, `None` to let the transport pick.
    pub local: Option<SocketAddr>,
    /// Outbound interface index (0 for the default route).
    pub if_index: u32,
    /// Connection that produced the datagram, if any.
    pub connection: Option<ConnectionRef>,
    /// Segment size when the buffer holds several coalesced packets for
    /// segmentation offload; 0 for a single datagram.
    pub segment_size: usize,
}

/// Result of one `prepare_next_to_send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A datagram is ready in the send buffer.
    Datagram(SendInfo),
    /// Nothing more to send right now.
    Idle,
    /// The engine asks the loop to leave the send phase.
    Signal(LoopSignal),
}

/// Status driving the packet loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopSignal {
    /// Keep running.
    #[default]
    Continue,
    /// Clean shutdown requested; the loop exits with success.
    Terminate,
    /// Test hook: replace the primary endpoint to simulate NAT rebinding.
    SimulateNat,
    /// Test hook: add an endpoint and probe a new path.
    SimulateMigration,
    /// Abort the loop with this status code.
    Error(i32),
}

impl LoopSignal {
    #[inline]
    pub fn is_continue(self) -> bool {
        matches!(self, LoopSignal::Continue)
    }

    /// True for the two migration test sentinels.
    #[inline]
    pub fn is_migration_test(self) -> bool {
        matches!(self, LoopSignal::SimulateNat | LoopSignal::SimulateMigration)
    }
}

impl fmt::Display for LoopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopSignal::Continue => write!(f, "continue"),
            LoopSignal::Terminate => write!(f, "terminate"),
            LoopSignal::SimulateNat => write!(f, "simulate-nat"),
            LoopSignal::SimulateMigration => write!(f, "simulate-migration"),
            LoopSignal::Error(code) => write!(f, "error({})", code),
        }
    }
}

/// Addresses of a connection's primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathAddrs {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// The protocol engine as seen by the packet loop.
///
/// One engine instance is owned by exactly one worker; implementations do
/// not need to be `Sync`.
pub trait ProtocolEngine {
    /// How long the loop may block before it must call back in, capped at
    /// `max_delay`.
    fn next_wake_delay(&mut self, now: Instant, max_delay: Duration) -> Duration;

    /// Deliver one datagram. Malformed input is dropped by the engine.
    /// Returns the connection the datagram was routed to, if any.
    fn submit_received(
        &mut self,
        payload: &[u8],
        info: &RecvInfo,
        now: Instant,
    ) -> Option<ConnectionRef>;

    /// Write the next datagram into `buf`.
    fn prepare_next_to_send(&mut self, now: Instant, buf: &mut [u8]) -> SendOutcome;

    /// A send failed with an error implying the destination is unreachable.
    fn notify_destination_unreachable(
        &mut self,
        _connection: ConnectionRef,
        _now: Instant,
        _peer: SocketAddr,
        _local: Option<SocketAddr>,
        _if_index: u32,
        _os_error: i32,
    ) {
    }

    /// Addresses of the connection's primary path.
    fn primary_path(&self, _connection: ConnectionRef) -> Option<PathAddrs> {
        None
    }

    /// Start validating a new path from `local` to `peer`.
    fn probe_new_path(
        &mut self,
        _connection: ConnectionRef,
        _peer: SocketAddr,
        _local: SocketAddr,
        _now: Instant,
    ) -> LoopSignal {
        LoopSignal::Continue
    }

    /// Application-level diagnostic, attached to a connection when known.
    fn log_app_message(&mut self, connection: Option<ConnectionRef>, message: &str) {
        match connection {
            Some(cnx) => tracing::info!(connection = cnx.0, "{}", message),
            None => tracing::info!("{}", message),
        }
    }
}

/// Points at which the loop reports to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Endpoints are open and the loop is about to start.
    Ready,
    /// A receive burst was submitted.
    AfterReceive { bytes: usize },
    /// The send phase drained the engine.
    AfterSend { bytes: usize },
    /// The effective local address changed (startup or NAT simulation).
    PortUpdate(SocketAddr),
}

/// Caller hook invoked at every [`LoopEvent`].
///
/// Any result other than `Continue` and the two migration sentinels stops
/// the loop; `Terminate` stops it cleanly.
pub trait LoopCallback {
    fn on_event(&mut self, event: LoopEvent) -> LoopSignal;
}

impl<F> LoopCallback for F
where
    F: FnMut(LoopEvent) -> LoopSignal,
{
    fn on_event(&mut self, event: LoopEvent) -> LoopSignal {
        self(event)
    }
}

/// Callback that never interferes with the loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallback;

impl LoopCallback for NoCallback {
    fn on_event(&mut self, _event: LoopEvent) -> LoopSignal {
        LoopSignal::Continue
    }
}
