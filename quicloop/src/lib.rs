//! quicloop library crate, shared by the binary, the integration tests and
//! the benchmarks.
//!
//! The main binary is in main.rs.

pub mod config;
pub mod demo;
pub mod error;
pub mod netio;
pub mod nic;
pub mod runtime;
pub mod telemetry;
pub mod worker;
