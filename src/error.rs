//! Custom error types for the bench core.
//!
//! `BenchError` is the single error type returned by every fallible operation in
//! the library. It is built with `thiserror` and groups failures by where they
//! originate:
//!
//! - **Addressing** (`InvalidAddress`): a host that cannot be dialed at all.
//! - **Transport** (`Connect`, `Transport`, `ConnectionClosed`, `Identification`):
//!   the SCPI socket could not be opened, written or read. SCPI operations abort
//!   and surface these to the caller after the connection has been closed.
//! - **Telemetry** (`Telemetry`, `TelemetryBusy`): a CDS adapter operation failed.
//!   The poll loop logs these and keeps sampling.
//! - **Audit log** (`Csv`, `Io`, `CsvLoggingActive`): CSV file handling.
//! - **Configuration** (`Config`, `Configuration`): loading or validating
//!   `BenchConfig`.
//!
//! A response timeout is not an error; see
//! [`crate::scpi::ScpiResponse::no_data`].

use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Errors produced by the SCPI client, telemetry loop, audit log and config loader.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Invalid device address: '{0}'")]
    InvalidAddress(String),

    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("SCPI transport error on '{command}': {source}")]
    Transport {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by device while waiting for '{0}'")]
    ConnectionClosed(String),

    #[error("Failed to retrieve device identification from {host}: {reason}")]
    Identification { host: String, reason: String },

    #[error("Telemetry adapter error during {operation}: {detail}")]
    Telemetry { operation: String, detail: String },

    #[error("Telemetry adapter is owned by the active poll loop")]
    TelemetryBusy,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV logging already active: {0}")]
    CsvLoggingActive(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl BenchError {
    /// Build a telemetry error from an adapter operation name and detail text.
    pub fn telemetry(operation: impl Into<String>, detail: impl ToString) -> Self {
        BenchError::Telemetry {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// True for socket-level SCPI failures (refused, reset, write/read errors).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BenchError::Connect { .. }
                | BenchError::Transport { .. }
                | BenchError::ConnectionClosed(_)
                | BenchError::Identification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_errors() {
        let refused = BenchError::Connect {
            host: "10.0.0.1".into(),
            port: 5025,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_transport());
        assert!(BenchError::ConnectionClosed("MEAS:POW?".into()).is_transport());

        assert!(!BenchError::telemetry("read", "timeout").is_transport());
        assert!(!BenchError::Configuration("bad".into()).is_transport());
    }

    #[test]
    fn telemetry_error_message_names_operation() {
        let err = BenchError::telemetry("stop_session", "socket gone");
        assert_eq!(
            err.to_string(),
            "Telemetry adapter error during stop_session: socket gone"
        );
    }
}
