//! Error taxonomy for the packet engine.
//!
//! - **Fatal configuration errors** ([`BindError`] at startup, [`DeviceError`],
//!   [`ConfigError`]) abort the affected worker or the process.
//! - **Transient I/O errors** never surface here; they are classified by the
//!   send retry policy and logged.
//! - **Protocol sentinels** are `LoopSignal` values, not errors.

use std::io;
use thiserror::Error;

/// Failure while opening transport endpoints.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot open {requested} endpoints, maximum is {max}")]
    TooManyEndpoints { requested: usize, max: usize },

    #[error("creating {family} socket")]
    Socket {
        family: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("setting {option} on {family} socket")]
    SocketOption {
        family: &'static str,
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("binding {family} socket to port {port}")]
    Bind {
        family: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("reading local address of {family} socket")]
    LocalAddr {
        family: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("NIC queue {queue} has no free UDP port")]
    PortsExhausted { queue: u16 },
}

/// Failure while provisioning NIC resources.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("reading device info for port {port}: {reason}")]
    Info { port: u16, reason: String },

    #[error("configuring port {port} with {queues} queues: {reason}")]
    Configure { port: u16, queues: u16, reason: String },

    #[error("adjusting descriptors on port {port}: {reason}")]
    Descriptors { port: u16, reason: String },

    #[error("creating buffer pool {name} ({buffers} buffers): {reason}")]
    Pool {
        name: String,
        buffers: usize,
        reason: String,
    },

    #[error("setting up {direction} queue {queue} on port {port}: {reason}")]
    QueueSetup {
        port: u16,
        queue: u16,
        direction: &'static str,
        reason: String,
    },

    #[error("allocating transmit staging buffer for queue {queue}")]
    Staging { queue: u16 },

    #[error("starting port {port}: {reason}")]
    Start { port: u16, reason: String },

    #[error("no NIC port could be provisioned")]
    NoPorts,
}

/// Inconsistent startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("worker count ({workers}) does not match queue count ({queues})")]
    WorkerQueueMismatch { workers: usize, queues: usize },

    #[error("only {provisioned} of {requested} NIC units were provisioned")]
    PartialFleet { provisioned: usize, requested: usize },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Final status of a packet loop that did not end cleanly.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("no endpoint could be opened")]
    Bind(#[from] BindError),

    #[error("transport is not ready: {0}")]
    Transport(String),

    #[error("packet loop aborted with status {0}")]
    Aborted(i32),
}

impl LoopError {
    /// Numeric status comparable to the callback's own codes.
    pub fn status_code(&self) -> i32 {
        match self {
            LoopError::Bind(_) | LoopError::Transport(_) => -1,
            LoopError::Aborted(code) => *code,
        }
    }
}
