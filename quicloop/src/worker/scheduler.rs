//! The packet loop scheduler.
//!
//! One [`PacketLoop`] per worker alternates between a receive phase and a
//! send phase until the caller, the engine or the stop flag ends it:
//!
//! ```text
//! Ready → PortUpdate
//! loop {
//!     wait up to next_wake_delay (0 right after a non-empty burst)
//!     submit every datagram → AfterReceive → re-poll immediately
//!     nothing received → drain prepare_next_to_send → AfterSend
//!     SimulateNat / SimulateMigration → migration test controller
//! }
//! close endpoints
//! ```
//!
//! The scheduler never shares state with other workers; everything it
//! touches is owned or exclusively borrowed.

use super::migration::{self, MigrationState};
use super::retry::{self, SendFailure};
use super::transport::{unspecified_like, Datagram, Transport};
use crate::error::LoopError;
use crate::netio::config::{GSO_SEND_BUFFER_SIZE, SEND_BUFFER_SIZE};
use crate::netio::{loopback_addr, AddressFamily, Endpoint, NetIoConfig, SendMeta};
use crate::telemetry::{record_metric, MetricsEvent};
use quicloop_x::{
    ConnectionRef, LoopCallback, LoopEvent, LoopSignal, ProtocolEngine, RecvInfo, SendInfo,
    SendOutcome,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Waits may overshoot the requested delay by this much before they are
/// reported.
pub const DEFAULT_OVERRUN_SLACK: Duration = Duration::from_millis(5);

/// Fixed parameters of one loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopParams {
    pub worker_id: usize,
    /// Upper bound for a single wait.
    pub max_wake_delay: Duration,
    pub send_buffer_size: usize,
    /// Outbound interface used when the engine leaves it unset.
    pub dest_if: u32,
    pub overrun_slack: Duration,
}

impl LoopParams {
    /// Derive loop parameters from configuration. `gso` tells whether the
    /// transport accepts coalesced buffers.
    pub fn new(worker_id: usize, config: &NetIoConfig, dest_if: u32, gso: bool) -> Self {
        Self {
            worker_id,
            max_wake_delay: Duration::from_micros(config.max_wake_delay_us),
            send_buffer_size: if gso && !config.disable_gso {
                GSO_SEND_BUFFER_SIZE
            } else {
                SEND_BUFFER_SIZE
            },
            dest_if,
            overrun_slack: DEFAULT_OVERRUN_SLACK,
        }
    }
}

/// Mutable state owned by one loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopState {
    /// Connection that most recently received a datagram.
    pub last_connection: Option<ConnectionRef>,
    pub migration: MigrationState,
    /// Skip the wait on the next receive phase.
    pub immediate: bool,
    pub wake_deadline: Option<Instant>,
}

enum ReceiveOutcome {
    /// A burst was submitted and the caller wants more.
    Again,
    /// Nothing arrived (or the wait failed): go send.
    Send,
    Signal(LoopSignal),
}

/// Packet loop bound to a transport, an engine and a caller callback.
pub struct PacketLoop<'a, T, P: ?Sized, C: ?Sized> {
    transport: T,
    engine: &'a mut P,
    callback: &'a mut C,
    params: LoopParams,
    state: LoopState,
    running: Arc<AtomicBool>,
    send_buf: Vec<u8>,
    ports: Vec<u16>,
}

impl<'a, T, P, C> PacketLoop<'a, T, P, C>
where
    T: Transport,
    P: ProtocolEngine + ?Sized,
    C: LoopCallback + ?Sized,
{
    /// `running` is checked once per iteration; clearing it ends the loop
    /// cleanly.
    pub fn new(
        transport: T,
        engine: &'a mut P,
        callback: &'a mut C,
        params: LoopParams,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            engine,
            callback,
            params,
            state: LoopState::default(),
            running,
            send_buf: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Run until terminated. Every endpoint is closed on return.
    pub fn run(&mut self) -> Result<(), LoopError> {
        let status = self.start().and_then(|proceed| {
            if proceed {
                self.drive()
            } else {
                Ok(())
            }
        });

        self.transport.close();
        self.send_buf = Vec::new();

        match &status {
            Ok(()) => info!(worker_id = self.params.worker_id, "Packet loop terminated"),
            Err(e) => warn!(worker_id = self.params.worker_id, error = %e, "Packet loop aborted"),
        }
        status
    }

    /// Returns false when the callback ended the loop before it started.
    fn start(&mut self) -> Result<bool, LoopError> {
        let Some(primary) = self.transport.endpoints().get(0) else {
            return Err(LoopError::Transport("no endpoint is open".to_string()));
        };
        let ready_addr = loopback_addr(primary.family(), primary.local_port());

        let mut buf = Vec::new();
        buf.try_reserve_exact(self.params.send_buffer_size)
            .map_err(|_| LoopError::Transport("cannot allocate the send buffer".to_string()))?;
        buf.resize(self.params.send_buffer_size, 0);
        self.send_buf = buf;

        let mut signal = self.callback.on_event(LoopEvent::Ready);
        if signal.is_continue() {
            signal = self.callback.on_event(LoopEvent::PortUpdate(ready_addr));
        }

        info!(
            worker_id = self.params.worker_id,
            endpoints = self.transport.endpoints().len(),
            port = ready_addr.port(),
            send_buffer = self.params.send_buffer_size,
            "Packet loop ready"
        );

        match signal {
            LoopSignal::Continue => Ok(true),
            LoopSignal::Terminate => Ok(false),
            LoopSignal::Error(code) => Err(LoopError::Aborted(code)),
            other => {
                warn!(signal = %other, "Migration test requested before the loop started");
                Ok(true)
            }
        }
    }

    fn drive(&mut self) -> Result<(), LoopError> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                debug!(worker_id = self.params.worker_id, "Stop requested");
                return Ok(());
            }

            let mut signal = match self.receive_phase() {
                ReceiveOutcome::Again => continue,
                ReceiveOutcome::Send => self.send_phase(),
                ReceiveOutcome::Signal(signal) => signal,
            };

            if signal.is_migration_test() {
                signal = migration::run_test(
                    signal,
                    &mut self.transport,
                    &mut *self.engine,
                    &mut *self.callback,
                    &mut self.state.migration,
                    self.state.last_connection,
                    Instant::now(),
                );
            }

            match signal {
                LoopSignal::Continue => {}
                LoopSignal::Terminate => return Ok(()),
                LoopSignal::Error(code) => return Err(LoopError::Aborted(code)),
                nested => debug!(signal = %nested, "Nested migration test request ignored"),
            }
        }
    }

    fn receive_phase(&mut self) -> ReceiveOutcome {
        let now = Instant::now();
        let delay = if self.state.immediate {
            Duration::ZERO
        } else {
            self.engine
                .next_wake_delay(now, self.params.max_wake_delay)
                .min(self.params.max_wake_delay)
        };
        self.state.immediate = false;
        self.state.wake_deadline = Some(now + delay);

        self.ports.clear();
        self.ports
            .extend(self.transport.endpoints().iter().map(Endpoint::local_port));

        let engine = &mut *self.engine;
        let ports = &self.ports;
        let migration = self.state.migration;
        let mut last_connection = self.state.last_connection;
        let started = Instant::now();

        let result = {
            let mut on_datagram = |dg: Datagram<'_>| {
                let bound = ports.get(dg.endpoint).copied().unwrap_or(0);
                let local_ip = dg.local_ip.unwrap_or_else(|| unspecified_like(&dg.peer));
                let info = RecvInfo {
                    peer: dg.peer,
                    local: SocketAddr::new(local_ip, migration.receive_port(dg.endpoint, bound)),
                    if_index: dg.if_index,
                    ecn: dg.ecn,
                };
                trace!(peer = %info.peer, local = %info.local, bytes = dg.payload.len(), "Datagram received");
                if let Some(cnx) = engine.submit_received(dg.payload, &info, Instant::now()) {
                    last_connection = Some(cnx);
                }
                record_metric(MetricsEvent::PacketReceived {
                    bytes: dg.payload.len(),
                });
            };
            self.transport.receive(delay, &mut on_datagram)
        };
        self.state.last_connection = last_connection;

        match result {
            Ok(summary) if !summary.is_empty() => {
                let signal = self.callback.on_event(LoopEvent::AfterReceive {
                    bytes: summary.bytes,
                });
                if signal.is_continue() {
                    self.state.immediate = true;
                    ReceiveOutcome::Again
                } else {
                    ReceiveOutcome::Signal(signal)
                }
            }
            Ok(_) => {
                let waited = started.elapsed();
                record_metric(MetricsEvent::IdleTime {
                    micros: waited.as_micros() as u64,
                });
                if waited > delay + self.params.overrun_slack {
                    debug!(
                        worker_id = self.params.worker_id,
                        requested_us = delay.as_micros() as u64,
                        waited_us = waited.as_micros() as u64,
                        "Wake overrun"
                    );
                    record_metric(MetricsEvent::WakeOverrun);
                }
                ReceiveOutcome::Send
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReceiveOutcome::Send,
            Err(e) => {
                warn!(worker_id = self.params.worker_id, error = %e, "Receive failed");
                record_metric(MetricsEvent::NetworkReceiveError);
                ReceiveOutcome::Send
            }
        }
    }

    fn send_phase(&mut self) -> LoopSignal {
        let now = Instant::now();
        let mut bytes_sent = 0usize;

        let signal = loop {
            match self.engine.prepare_next_to_send(now, &mut self.send_buf) {
                SendOutcome::Datagram(info) if info.len > 0 => {
                    let len = info.len.min(self.send_buf.len());
                    bytes_sent += len;
                    self.send_datagram(&info, len);
                }
                SendOutcome::Datagram(_) | SendOutcome::Idle => break LoopSignal::Continue,
                SendOutcome::Signal(signal) => break signal,
            }
        };
        self.transport.flush();

        if signal.is_continue() {
            self.callback.on_event(LoopEvent::AfterSend { bytes: bytes_sent })
        } else {
            signal
        }
    }

    fn send_datagram(&mut self, info: &SendInfo, len: usize) {
        let endpoint = self
            .state
            .migration
            .send_override(info.local, self.transport.endpoints().len())
            .or_else(|| {
                self.transport
                    .endpoints()
                    .find_family(AddressFamily::of(&info.peer))
            });
        let meta = SendMeta {
            peer: info.peer,
            local: info.local,
            if_index: if info.if_index != 0 {
                info.if_index
            } else {
                self.params.dest_if
            },
            segment_size: info.segment_size,
        };

        let payload = &self.send_buf[..len];
        let result = match endpoint {
            Some(index) => self.transport.send(index, payload, &meta),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no endpoint for the peer address family",
            )),
        };

        match result {
            Ok(_) => record_metric(MetricsEvent::PacketSent { bytes: len }),
            Err(err) => self.handle_send_failure(endpoint, info, &meta, len, err),
        }
    }

    fn handle_send_failure(
        &mut self,
        endpoint: Option<usize>,
        info: &SendInfo,
        meta: &SendMeta,
        len: usize,
        err: io::Error,
    ) {
        let message = format!(
            "Could not send message to {}, from {}, if={}, err={}",
            info.peer,
            info.local
                .map(|a| a.to_string())
                .unwrap_or_else(|| "any".to_string()),
            meta.if_index,
            err
        );
        debug!(
            worker_id = self.params.worker_id,
            peer = %info.peer,
            if_index = meta.if_index,
            len,
            os_error = ?err.raw_os_error(),
            "Send failed"
        );

        let Some(cnx) = info.connection else {
            self.engine.log_app_message(None, &message);
            record_metric(MetricsEvent::NetworkSendError);
            return;
        };
        self.engine.log_app_message(Some(cnx), &message);

        match retry::classify(&err, len, info.segment_size) {
            SendFailure::Unreachable => {
                self.engine.notify_destination_unreachable(
                    cnx,
                    Instant::now(),
                    info.peer,
                    info.local,
                    meta.if_index,
                    err.raw_os_error().unwrap_or(0),
                );
                record_metric(MetricsEvent::DestinationUnreachable);
            }
            SendFailure::TooLarge => match endpoint {
                Some(index) => self.resend_in_chunks(index, cnx, meta, len),
                None => record_metric(MetricsEvent::NetworkSendError),
            },
            SendFailure::Other => record_metric(MetricsEvent::NetworkSendError),
        }
    }

    fn resend_in_chunks(&mut self, endpoint: usize, cnx: ConnectionRef, meta: &SendMeta, len: usize) {
        let segment = meta.segment_size;
        let chunk_meta = SendMeta {
            segment_size: 0,
            ..*meta
        };
        let transport = &mut self.transport;
        let buf = &self.send_buf[..len];

        match retry::resend_in_chunks(len, segment, |range| {
            transport.send(endpoint, &buf[range], &chunk_meta)
        }) {
            Ok(chunks) => {
                self.engine.log_app_message(
                    Some(cnx),
                    &format!("Retry of {} bytes by chunks of {} bytes succeeds.", len, segment),
                );
                record_metric(MetricsEvent::ChunkedResend { chunks });
            }
            Err(failure) => {
                self.engine.log_app_message(
                    Some(cnx),
                    &format!(
                        "Retry with packet size={} fails at index {}, err={}.",
                        failure.chunk_len, failure.offset, failure.error
                    ),
                );
                record_metric(MetricsEvent::NetworkSendError);
            }
        }
        self.transport.flush();
    }
}
