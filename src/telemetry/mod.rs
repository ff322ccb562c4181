//! CDS telemetry
//!
//! The CDS adapter is a vendor device reporting measurements of the device
//! under test. Its wire protocol lives outside this crate; the bench consumes
//! it through the capability traits below:
//!
//! - [`CdsConnector::connect`] opens an adapter connection
//! - [`CdsAdapter::start_session`] / [`CdsAdapter::stop_session`] bracket the
//!   "global status" subscription that keeps measurement channels updating
//! - [`CdsAdapter::read_value`] decodes one channel `(group, index)` to a float
//! - [`CdsAdapter::disconnect`] releases the connection
//!
//! A [`TelemetrySession`] wraps one adapter connection. The [`TelemetryPoller`]
//! owns at most one session at a time and samples it on a fixed delay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BenchError, BenchResult};

pub mod mock;
mod poller;

pub use poller::{PollState, TelemetryPoller};

/// Fixed TCP port of the CDS adapter
pub const CDS_PORT: u16 = 51001;

/// Known CDS measurement channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Channel {
    /// Measured L1 voltage (V)
    VoltageL1,
    /// Measured real power (W)
    RealPower,
    /// Measured L1 current (A)
    CurrentL1,
    /// Maximum AC current offered by the EVSE (A)
    EvseMaxCurrent,
    /// PWM duty cycle seen by the EV (%)
    EvDuty,
}

impl Channel {
    /// Every known channel
    pub const ALL: [Channel; 5] = [
        Channel::VoltageL1,
        Channel::RealPower,
        Channel::CurrentL1,
        Channel::EvseMaxCurrent,
        Channel::EvDuty,
    ];

    /// `(group, index)` address on the adapter
    pub const fn address(self) -> (u8, u8) {
        match self {
            Channel::VoltageL1 => (0x08, 0x66),
            Channel::RealPower => (0x08, 0x43),
            Channel::CurrentL1 => (0x08, 0x6C),
            Channel::EvseMaxCurrent => (0x02, 0xE5),
            Channel::EvDuty => (0x07, 0xD4),
        }
    }

    /// Reverse lookup of [`Channel::address`]
    pub fn from_address(group: u8, index: u8) -> Option<Channel> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.address() == (group, index))
    }
}

/// One open adapter connection.
#[async_trait]
pub trait CdsAdapter: Send {
    /// Begin the global-status subscription
    async fn start_session(&mut self) -> BenchResult<()>;

    /// Read and decode the channel at `(group, index)`
    async fn read_value(&mut self, group: u8, index: u8) -> BenchResult<f64>;

    /// End the global-status subscription
    async fn stop_session(&mut self) -> BenchResult<()>;

    /// Close the connection
    async fn disconnect(&mut self) -> BenchResult<()>;
}

/// Opens adapter connections.
#[async_trait]
pub trait CdsConnector: Send + Sync {
    /// Connect to the adapter at `host:port`
    async fn connect(&self, host: &str, port: u16) -> BenchResult<Box<dyn CdsAdapter>>;
}

/// Stand-in used when no CDS driver is linked into the build.
///
/// Every connect fails, so telemetry never publishes a voltage and the
/// interlock keeps the sink de-energized.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlinkedCdsConnector;

#[async_trait]
impl CdsConnector for UnlinkedCdsConnector {
    async fn connect(&self, host: &str, port: u16) -> BenchResult<Box<dyn CdsAdapter>> {
        Err(BenchError::telemetry(
            "connect",
            format!("no CDS adapter driver available for {host}:{port}"),
        ))
    }
}

/// Latest voltage/current/power of the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// L1 voltage in V
    pub voltage_v: i64,
    /// L1 current in A
    pub current_a: i64,
    /// Real power in W
    pub power_w: i64,
    /// End of the tick that produced this sample; `None` before the first tick
    pub timestamp: Option<DateTime<Utc>>,
}

/// A sample plus the channels that failed while producing it
#[derive(Debug)]
pub struct SampleOutcome {
    /// The new sample; failed channels keep their previous value
    pub sample: TelemetrySample,
    /// Per-channel read errors, in read order
    pub errors: Vec<(Channel, BenchError)>,
}

/// Round half up, the way the adapter's readings have always been displayed.
fn round_reading(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

/// One adapter connection with an active global-status subscription.
pub struct TelemetrySession {
    adapter: Box<dyn CdsAdapter>,
    host: String,
}

impl TelemetrySession {
    /// Connect and start the global-status subscription.
    ///
    /// If the subscription cannot be started the connection is released again.
    pub async fn open(connector: &dyn CdsConnector, host: &str, port: u16) -> BenchResult<Self> {
        let mut adapter = connector.connect(host, port).await?;

        if let Err(err) = adapter.start_session().await {
            if let Err(disconnect_err) = adapter.disconnect().await {
                warn!(
                    host,
                    error = %disconnect_err,
                    "Error disconnecting CDS adapter after failed start"
                );
            }
            return Err(err);
        }

        info!(host, port, "CDS global status started");
        Ok(Self {
            adapter,
            host: host.to_string(),
        })
    }

    /// Adapter host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Read one channel as a raw float
    pub async fn read(&mut self, channel: Channel) -> BenchResult<f64> {
        let (group, index) = channel.address();
        let value = self.adapter.read_value(group, index).await?;
        if !value.is_finite() {
            return Err(BenchError::telemetry(
                "decode",
                format!("{channel:?} returned non-finite value {value}"),
            ));
        }
        Ok(value)
    }

    /// Read voltage, power and current, in that order.
    ///
    /// Voltage and current always replace the previous value; power only when
    /// the new reading is positive (the sensor reads noise around zero). A
    /// failed channel keeps its previous value and is reported in the outcome.
    pub async fn sample(&mut self, previous: &TelemetrySample) -> SampleOutcome {
        let mut sample = *previous;
        let mut errors = Vec::new();

        match self.read(Channel::VoltageL1).await {
            Ok(value) => sample.voltage_v = round_reading(value),
            Err(err) => errors.push((Channel::VoltageL1, err)),
        }

        match self.read(Channel::RealPower).await {
            Ok(value) => {
                let power = round_reading(value);
                if power > 0 {
                    sample.power_w = power;
                }
            }
            Err(err) => errors.push((Channel::RealPower, err)),
        }

        match self.read(Channel::CurrentL1).await {
            Ok(value) => sample.current_a = round_reading(value),
            Err(err) => errors.push((Channel::CurrentL1, err)),
        }

        sample.timestamp = Some(Utc::now());
        debug!(
            host = %self.host,
            voltage_v = sample.voltage_v,
            power_w = sample.power_w,
            current_a = sample.current_a,
            "CDS sample"
        );
        SampleOutcome { sample, errors }
    }

    /// End the subscription and disconnect.
    ///
    /// Both steps are always attempted; their errors are returned for the
    /// caller to log and the connection handle is released regardless.
    pub async fn close(mut self) -> Vec<BenchError> {
        let mut errors = Vec::new();

        if let Err(err) = self.adapter.stop_session().await {
            errors.push(err);
        }
        if let Err(err) = self.adapter.disconnect().await {
            errors.push(err);
        }

        info!(host = %self.host, "CDS global status stopped");
        errors
    }
}
