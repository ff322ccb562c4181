//! SCPI over raw TCP
//!
//! The sink speaks newline-terminated ASCII SCPI on port 5025. Every logical
//! operation opens its own connection, identifies the peer with `*IDN?`, sends
//! its commands in order and closes the connection again, on success and on
//! failure alike. Connections are never shared between operations.
//!
//! ## Response framing
//!
//! There is no correlation between a command and its reply. After a write the
//! link waits up to the response window (1 s by default) for the next inbound
//! data chunk and treats it as the response. If nothing arrives the call still
//! succeeds with [`ScpiResponse::no_data`]: setters such as `OUTP ON` never
//! reply, and must not be reported as failures.
//!
//! This also means a command the device silently dropped looks exactly like an
//! acknowledged setter. Only socket errors are failures.
//!
//! ## Layers
//!
//! - [`ScpiConnector`] / [`ScpiLink`]: the transport seam (TCP in production,
//!   [`mock::MockScpiConnector`] in tests and simulation)
//! - [`SinkController`]: typed sink operations, gated by the safety interlock

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BenchResult;

pub mod commands;
pub mod mock;
pub mod transport;

pub use commands::{compute_current_for_power, LossCurve, SinkController};
pub use transport::{TcpScpiConnector, TcpScpiLink};

/// Default SCPI raw socket port
pub const SCPI_PORT: u16 = 5025;

/// Default response window in milliseconds
pub const RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Message reported when the response window elapses without data
pub const NO_DATA_MSG: &str = "no data received";

/// Outcome of a single SCPI command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScpiResponse {
    /// False only before a command completed; transport errors are `Err`, not responses
    pub successful: bool,
    /// Trimmed response text, or [`NO_DATA_MSG`]
    pub msg: String,
}

impl ScpiResponse {
    /// Response carrying data received from the device
    pub fn data(msg: impl AsRef<str>) -> Self {
        Self {
            successful: true,
            msg: msg.as_ref().trim().to_string(),
        }
    }

    /// Response for a command the device did not answer within the window
    pub fn no_data() -> Self {
        Self {
            successful: true,
            msg: NO_DATA_MSG.to_string(),
        }
    }

    /// True when the response window elapsed without data
    pub fn is_no_data(&self) -> bool {
        self.msg == NO_DATA_MSG
    }
}

/// Latest sink power readback
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SinkPowerReading {
    /// Whether the last query completed
    pub successful: bool,
    /// Raw `MEAS:POW?` response text
    pub msg: String,
}

impl SinkPowerReading {
    /// Parsed power in W, if the message is numeric
    pub fn watts(&self) -> Option<f64> {
        self.msg.trim().parse::<f64>().ok()
    }
}

impl From<ScpiResponse> for SinkPowerReading {
    fn from(response: ScpiResponse) -> Self {
        Self {
            successful: response.successful,
            msg: response.msg,
        }
    }
}

/// One open SCPI connection.
///
/// Only one command may be in flight at a time: the next inbound data after a
/// write is taken as its response.
#[async_trait]
pub trait ScpiLink: Send {
    /// Write `command` followed by `\n` and wait for the response window
    async fn send(&mut self, command: &str) -> BenchResult<ScpiResponse>;

    /// Release the connection. Never fails; errors are logged.
    async fn close(&mut self);
}

/// Opens identified SCPI links to a host.
#[async_trait]
pub trait ScpiConnector: Send + Sync {
    /// Connect to `host` and complete the `*IDN?` handshake
    async fn open(&self, host: &str) -> BenchResult<Box<dyn ScpiLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_response_is_trimmed() {
        let response = ScpiResponse::data("  1.234E+03\r\n");
        assert!(response.successful);
        assert_eq!(response.msg, "1.234E+03");
        assert!(!response.is_no_data());
    }

    #[test]
    fn timeout_response_is_successful() {
        let response = ScpiResponse::no_data();
        assert!(response.successful);
        assert_eq!(response.msg, "no data received");
        assert!(response.is_no_data());
    }

    #[test]
    fn sink_reading_parses_watts() {
        let reading = SinkPowerReading::from(ScpiResponse::data("1.5E+03"));
        assert_eq!(reading.watts(), Some(1500.0));
        assert_eq!(SinkPowerReading::default().watts(), None);
    }
}
