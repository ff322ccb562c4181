//! Bench controller.
//!
//! [`LoadBench`] wires the sink command set, both poll loops and the CSV audit
//! logger together. The latest telemetry sample and sink readback flow between
//! them over `watch` channels:
//!
//! ```text
//! TelemetryPoller ──samples──▶ SinkController (interlock)
//!        │                    ▶ callers
//!        └──log_row(sample, sink)──▶ CsvAuditLogger
//! SinkPowerPoller ──readings──▶ TelemetryPoller / callers
//! ```
//!
//! All state lives in the controller, so several benches can run side by side.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::audit::{CsvAuditLogger, CsvLoggingStatus};
use crate::config::BenchConfig;
use crate::error::BenchResult;
use crate::scpi::{compute_current_for_power, ScpiConnector, SinkController, SinkPowerReading};
use crate::sink_poll::SinkPowerPoller;
use crate::telemetry::{CdsConnector, Channel, PollState, TelemetryPoller, TelemetrySample};

/// One load bench: two sinks, one CDS adapter, one audit log.
pub struct LoadBench {
    config: BenchConfig,
    sink: Arc<SinkController>,
    telemetry: TelemetryPoller,
    sink_poll: SinkPowerPoller,
    audit: Arc<CsvAuditLogger>,
}

impl LoadBench {
    /// Build an idle bench. Nothing is connected until an operation asks for it.
    pub fn new(
        config: BenchConfig,
        scpi: Arc<dyn ScpiConnector>,
        cds: Arc<dyn CdsConnector>,
    ) -> Self {
        let (samples_tx, samples_rx) = watch::channel(TelemetrySample::default());
        let (sink_tx, sink_rx) = watch::channel(SinkPowerReading::default());

        let audit = Arc::new(CsvAuditLogger::new(config.storage.output_dir.clone()));
        let sink = Arc::new(SinkController::new(scpi, samples_rx));
        let telemetry = TelemetryPoller::new(
            cds,
            config.cds.port,
            config.settle_delay(),
            samples_tx,
            sink_rx,
            Arc::clone(&audit),
        );
        let sink_poll = SinkPowerPoller::new(Arc::clone(&sink), sink_tx);

        Self {
            config,
            sink,
            telemetry,
            sink_poll,
            audit,
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    // Telemetry

    /// Start (or restart) telemetry polling of the CDS adapter at `host`
    pub async fn start_telemetry(&self, host: &str, interval: Duration) -> BenchResult<()> {
        self.telemetry.start(host, interval).await
    }

    /// Stop telemetry polling and release the adapter
    pub async fn stop_telemetry(&self) {
        self.telemetry.stop().await;
    }

    /// Poll loop state
    pub fn telemetry_state(&self) -> PollState {
        self.telemetry.state()
    }

    /// Latest telemetry sample
    pub fn latest_sample(&self) -> TelemetrySample {
        self.telemetry.latest()
    }

    /// Watch telemetry samples
    pub fn subscribe_samples(&self) -> watch::Receiver<TelemetrySample> {
        self.telemetry.subscribe()
    }

    /// Latest L1 voltage (V)
    pub fn voltage(&self) -> i64 {
        self.telemetry.voltage()
    }

    /// Latest L1 current (A)
    pub fn current(&self) -> i64 {
        self.telemetry.current()
    }

    /// Latest real power (W)
    pub fn power(&self) -> i64 {
        self.telemetry.power()
    }

    /// Read a single channel outside the poll loop
    pub async fn read_channel_once(&self, host: &str, channel: Channel) -> BenchResult<f64> {
        self.telemetry.read_channel_once(host, channel).await
    }

    // Sink power readback

    /// Start periodic `MEAS:POW?`; `Ok(false)` if already running
    pub async fn start_sink_polling(
        &self,
        host: &str,
        interval: Duration,
        timeout: Duration,
    ) -> BenchResult<bool> {
        self.sink_poll.start(host, interval, timeout).await
    }

    /// Stop periodic `MEAS:POW?`
    pub async fn stop_sink_polling(&self) {
        self.sink_poll.stop().await;
    }

    /// Latest sink power readback
    pub fn sink_power_reading(&self) -> SinkPowerReading {
        self.sink_poll.latest()
    }

    /// Query the sink power once
    pub async fn sink_power_once(&self, host: &str) -> BenchResult<SinkPowerReading> {
        self.sink.sink_power(host).await
    }

    // Sink control

    /// Voltage priority mode; see [`SinkController::set_voltage_priority_mode`]
    pub async fn set_voltage_priority_mode(
        &self,
        host: &str,
        voltage_limit: f64,
        current_limit: f64,
    ) -> BenchResult<()> {
        self.sink
            .set_voltage_priority_mode(host, voltage_limit, current_limit)
            .await
    }

    /// Current priority mode; see [`SinkController::set_current_priority_mode`]
    pub async fn set_current_priority_mode(
        &self,
        host: &str,
        current_limit: f64,
        voltage_limit: f64,
    ) -> BenchResult<()> {
        self.sink
            .set_current_priority_mode(host, current_limit, voltage_limit)
            .await
    }

    /// Output on/off, gated by the interlock. Returns the state sent.
    pub async fn set_output(&self, host: &str, enabled: bool) -> BenchResult<bool> {
        self.sink.set_output(host, enabled).await
    }

    /// Current setpoint, gated by the interlock. Returns the value sent.
    pub async fn set_current_setpoint(&self, host: &str, current: f64) -> BenchResult<f64> {
        self.sink.set_current_setpoint(host, current).await
    }

    /// Current needed to draw `power_kw` at `voltage`
    pub fn compute_current_for_power(&self, power_kw: f64, voltage: f64) -> Option<f64> {
        compute_current_for_power(power_kw, voltage)
    }

    // CSV audit log

    /// Open a new audit file
    pub fn start_csv_logging(&self) -> BenchResult<PathBuf> {
        self.audit.start()
    }

    /// Close the audit session
    pub fn stop_csv_logging(&self) -> Option<PathBuf> {
        self.audit.stop()
    }

    /// Audit session status
    pub fn csv_logging_status(&self) -> CsvLoggingStatus {
        self.audit.status()
    }

    /// Stop both loops and the audit session.
    pub async fn shutdown(&self) {
        self.sink_poll.stop().await;
        self.telemetry.stop().await;
        if self.audit.is_enabled() {
            self.audit.stop();
        }
        info!("Load bench shut down");
    }
}
