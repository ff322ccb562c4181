//! # Load Bench Core Library
//!
//! Control and monitoring for an AC load test bench: two SCPI power sinks
//! driven over TCP and a CDS adapter reporting voltage, current and power of the
//! device under test. The `load-bench` binary is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`audit`**: CSV audit log, one row per telemetry tick while enabled.
//! - **`bench`**: `LoadBench`, the controller owning every loop and session.
//! - **`config`**: Figment-layered configuration (defaults, TOML, environment).
//! - **`error`**: The `BenchError` enum shared by every module.
//! - **`interlock`**: Minimum-voltage rule gating energizing sink commands.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`scpi`**: SCPI transport over TCP, the sink command set, a mock sink.
//! - **`sink_poll`**: Fixed-rate sink power readback.
//! - **`telemetry`**: CDS adapter capability traits, sessions and the poll loop.

pub mod audit;
pub mod bench;
pub mod config;
pub mod error;
pub mod interlock;
pub mod logging;
pub mod scpi;
pub mod sink_poll;
pub mod telemetry;

pub use bench::LoadBench;
pub use config::BenchConfig;
pub use error::{BenchError, BenchResult};
