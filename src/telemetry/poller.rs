//! Telemetry poll loop
//!
//! `Idle → Starting → Sampling → Stopping → Idle`
//!
//! - `start` opens a session (stopping and settling first if one is active)
//!   and spawns the loop.
//! - Each tick samples the session, publishes the sample and appends a CSV
//!   audit row. Read errors are logged and the loop carries on.
//! - The next tick is scheduled only after the current one finished, so the
//!   effective period is `interval + tick duration` and ticks never overlap.
//! - `stop` clears the active flag first, then tears the session down. The
//!   flag is checked before any I/O, so at most one tick runs after a stop.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CdsConnector, Channel, TelemetrySample, TelemetrySession};
use crate::audit::CsvAuditLogger;
use crate::error::{BenchError, BenchResult};
use crate::scpi::SinkPowerReading;

/// Telemetry poll loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PollState {
    /// No session
    #[default]
    Idle,
    /// Opening the adapter connection and subscription
    Starting,
    /// Loop running
    Sampling,
    /// Tearing the session down
    Stopping,
}

/// Everything a tick touches, shared between the poller and its loop task.
#[derive(Clone)]
struct TickContext {
    active: Arc<AtomicBool>,
    session: Arc<Mutex<Option<TelemetrySession>>>,
    samples: Arc<watch::Sender<TelemetrySample>>,
    sink_reading: watch::Receiver<SinkPowerReading>,
    audit: Arc<CsvAuditLogger>,
}

impl TickContext {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn run(self, interval: Duration) {
        while self.is_active() {
            self.tick().await;
            if !self.is_active() {
                break;
            }
            tokio::time::sleep(interval).await;
        }
        debug!("Telemetry poll loop exited");
    }

    async fn tick(&self) {
        let outcome = {
            let mut session = self.session.lock().await;
            if !self.is_active() {
                return;
            }
            let Some(session) = session.as_mut() else {
                return;
            };
            let previous = *self.samples.borrow();
            session.sample(&previous).await
        };

        for (channel, err) in &outcome.errors {
            warn!(channel = ?channel, error = %err, "CDS read failed; keeping previous value");
        }

        self.samples.send_replace(outcome.sample);

        let sink = self.sink_reading.borrow().clone();
        if let Err(err) = self.audit.log_row(&outcome.sample, &sink) {
            error!(error = %err, "Failed to append CSV audit row");
        }
    }
}

/// Owns the single CDS session and the loop sampling it.
///
/// Call [`TelemetryPoller::stop`] for an orderly teardown; dropping the poller
/// only aborts the loop.
pub struct TelemetryPoller {
    connector: Arc<dyn CdsConnector>,
    port: u16,
    settle_delay: Duration,
    ctx: TickContext,
    state: watch::Sender<PollState>,
    task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl TelemetryPoller {
    /// Create an idle poller.
    ///
    /// Samples are published on `samples`; every tick logs a row to `audit`
    /// using the current value of `sink_reading`.
    pub fn new(
        connector: Arc<dyn CdsConnector>,
        port: u16,
        settle_delay: Duration,
        samples: watch::Sender<TelemetrySample>,
        sink_reading: watch::Receiver<SinkPowerReading>,
        audit: Arc<CsvAuditLogger>,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            connector,
            port,
            settle_delay,
            ctx: TickContext {
                active: Arc::new(AtomicBool::new(false)),
                session: Arc::new(Mutex::new(None)),
                samples: Arc::new(samples),
                sink_reading,
                audit,
            },
            state,
            task: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Start polling `host` every `interval`.
    ///
    /// A running session is stopped first, followed by the settle delay, so
    /// that two adapter sessions are never open at once.
    pub async fn start(&self, host: &str, interval: Duration) -> BenchResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.ctx.is_active() || self.ctx.session.lock().await.is_some() {
            info!(host, "Telemetry polling already active; restarting");
            self.stop_locked().await;
            tokio::time::sleep(self.settle_delay).await;
        }

        self.state.send_replace(PollState::Starting);
        let session = match TelemetrySession::open(&*self.connector, host, self.port).await {
            Ok(session) => session,
            Err(err) => {
                self.state.send_replace(PollState::Idle);
                return Err(err);
            }
        };
        *self.ctx.session.lock().await = Some(session);

        self.ctx.active.store(true, Ordering::Release);
        self.state.send_replace(PollState::Sampling);
        let handle = tokio::spawn(self.ctx.clone().run(interval));
        *self.task.lock().await = Some(handle);

        info!(host, interval_ms = interval.as_millis() as u64, "Telemetry polling started");
        Ok(())
    }

    /// Stop polling and tear the session down. Teardown errors are logged.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        // Cleared before teardown so a pending tick sees it and does no I/O.
        self.ctx.active.store(false, Ordering::Release);

        // Waits for an in-flight tick to release the session.
        let session = self.ctx.session.lock().await.take();
        if let Some(session) = session {
            self.state.send_replace(PollState::Stopping);
            let host = session.host().to_string();
            for err in session.close().await {
                warn!(host = %host, error = %err, "Error during CDS teardown");
            }
        }

        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.state.send_replace(PollState::Idle);
    }

    /// Read one channel with a short-lived session.
    ///
    /// Refused while polling owns the adapter.
    pub async fn read_channel_once(&self, host: &str, channel: Channel) -> BenchResult<f64> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.ctx.is_active() {
            return Err(BenchError::TelemetryBusy);
        }

        let mut session = TelemetrySession::open(&*self.connector, host, self.port).await?;
        let value = session.read(channel).await;
        for err in session.close().await {
            warn!(host, error = %err, "Error during CDS teardown");
        }

        let value = value?;
        info!(host, channel = ?channel, value, "CDS one-shot read");
        Ok(value)
    }

    /// True while the loop is sampling
    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    /// Current state of the loop
    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Latest published sample
    pub fn latest(&self) -> TelemetrySample {
        *self.ctx.samples.borrow()
    }

    /// Watch published samples
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySample> {
        self.ctx.samples.subscribe()
    }

    /// Latest L1 voltage (V)
    pub fn voltage(&self) -> i64 {
        self.latest().voltage_v
    }

    /// Latest L1 current (A)
    pub fn current(&self) -> i64 {
        self.latest().current_a
    }

    /// Latest real power (W)
    pub fn power(&self) -> i64 {
        self.latest().power_w
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.ctx.active.store(false, Ordering::Release);
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::mock::MockCdsConnector;
    use crate::telemetry::CDS_PORT;
    use tracing_test::traced_test;

    const INTERVAL: Duration = Duration::from_millis(400);
    const SETTLE: Duration = Duration::from_millis(100);

    struct Harness {
        poller: TelemetryPoller,
        cds: MockCdsConnector,
        _sink_tx: watch::Sender<SinkPowerReading>,
        _dir: tempfile::TempDir,
        audit: Arc<CsvAuditLogger>,
    }

    fn harness(cds: MockCdsConnector) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(CsvAuditLogger::new(dir.path()));
        let (samples, _) = watch::channel(TelemetrySample::default());
        let (sink_tx, sink_rx) = watch::channel(SinkPowerReading::default());
        let poller = TelemetryPoller::new(
            Arc::new(cds.clone()),
            CDS_PORT,
            SETTLE,
            samples,
            sink_rx,
            Arc::clone(&audit),
        );
        Harness {
            poller,
            cds,
            _sink_tx: sink_tx,
            _dir: dir,
            audit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_samples_each_tick() {
        let h = harness(MockCdsConnector::steady(230.0, 3500.0, 15.0));
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        assert_eq!(h.poller.state(), PollState::Sampling);
        assert_eq!(h.cds.started_sessions(), h.cds.connects());

        rx.changed().await.unwrap();
        assert_eq!(h.poller.voltage(), 230);
        assert_eq!(h.poller.power(), 3500);
        assert_eq!(h.poller.current(), 15);

        h.poller.stop().await;
        assert_eq!(h.poller.state(), PollState::Idle);
        assert!(!h.poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn power_only_overwritten_when_positive() {
        let cds = MockCdsConnector::steady(230.0, 500.0, 10.0);
        cds.push_values(Channel::RealPower, &[0.0]);
        let h = harness(cds);
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(h.poller.power(), 0, "non-positive reading must not overwrite");
        assert_eq!(h.poller.voltage(), 230);
        assert_eq!(h.poller.current(), 10);

        rx.changed().await.unwrap();
        assert_eq!(h.poller.power(), 500);

        h.poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_never_overlaps_sessions() {
        let h = harness(MockCdsConnector::steady(230.0, 1000.0, 5.0));

        h.poller.start("cds", INTERVAL).await.unwrap();
        let started = tokio::time::Instant::now();
        h.poller.start("cds", INTERVAL).await.unwrap();
        assert!(started.elapsed() >= SETTLE);

        assert_eq!(h.cds.connects(), 2);
        assert_eq!(h.cds.started_sessions(), h.cds.connects());
        assert_eq!(h.cds.open_sessions(), 1);
        assert_eq!(h.cds.max_open_sessions(), 1);

        h.poller.stop().await;
        assert_eq!(h.cds.open_sessions(), 0);
        assert_eq!(h.cds.max_open_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reads_after_stop() {
        let h = harness(MockCdsConnector::steady(230.0, 1000.0, 5.0));
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        rx.changed().await.unwrap();
        h.poller.stop().await;

        let reads = h.cds.reads().len();
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(h.cds.reads().len(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_wait_for_interval() {
        let h = harness(MockCdsConnector::steady(230.0, 1000.0, 5.0));
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        rx.changed().await.unwrap();
        let first = tokio::time::Instant::now();
        rx.changed().await.unwrap();
        assert!(first.elapsed() >= INTERVAL);

        h.poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn read_errors_are_logged_and_loop_continues() {
        let cds = MockCdsConnector::steady(230.0, 1000.0, 5.0);
        cds.fail_channel(Channel::CurrentL1, true);
        let h = harness(cds);
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        rx.changed().await.unwrap();
        rx.changed().await.unwrap();

        assert!(h.poller.is_active());
        assert_eq!(h.poller.voltage(), 230);
        assert!(logs_contain("CDS read failed"));

        h.poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn teardown_errors_are_logged_not_raised() {
        let cds = MockCdsConnector::steady(230.0, 1000.0, 5.0);
        cds.fail_teardown(true);
        let h = harness(cds);

        h.poller.start("cds", INTERVAL).await.unwrap();
        h.poller.stop().await;

        assert_eq!(h.cds.open_sessions(), 0);
        assert_eq!(h.poller.state(), PollState::Idle);
        assert!(logs_contain("Error during CDS teardown"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_returns_to_idle() {
        let cds = MockCdsConnector::steady(230.0, 1000.0, 5.0);
        cds.refuse_connections(true);
        let h = harness(cds);

        assert!(h.poller.start("cds", INTERVAL).await.is_err());
        assert_eq!(h.poller.state(), PollState::Idle);
        assert!(!h.poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscription_returns_to_idle() {
        let cds = MockCdsConnector::steady(230.0, 1000.0, 5.0);
        cds.fail_start_session(true);
        let h = harness(cds);
        let mut states = h.poller.subscribe_state();

        assert!(h.poller.start("cds", INTERVAL).await.is_err());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), PollState::Idle);
        assert!(!h.poller.is_active());
        assert_eq!(h.cds.open_sessions(), 0);
        assert_eq!(h.cds.started_sessions(), 0);
        assert!(h.cds.reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_read_refused_while_polling() {
        let cds = MockCdsConnector::steady(230.0, 1000.0, 5.0);
        cds.set_value(Channel::EvDuty, 53.3);
        let h = harness(cds);

        assert_eq!(
            h.poller
                .read_channel_once("cds", Channel::EvDuty)
                .await
                .unwrap(),
            53.3
        );
        assert_eq!(h.cds.open_sessions(), 0);

        h.poller.start("cds", INTERVAL).await.unwrap();
        assert!(matches!(
            h.poller.read_channel_once("cds", Channel::EvDuty).await,
            Err(BenchError::TelemetryBusy)
        ));
        h.poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_feed_the_audit_log() {
        let h = harness(MockCdsConnector::steady(230.0, 1000.0, 5.0));
        let path = h.audit.start().unwrap();
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        rx.changed().await.unwrap();
        rx.changed().await.unwrap();
        h.poller.stop().await;
        h.audit.stop();

        let contents = std::fs::read_to_string(path).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].ends_with(",1000,230,5,,false"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn audit_write_errors_are_logged_and_loop_continues() {
        let h = harness(MockCdsConnector::steady(230.0, 1000.0, 5.0));
        let path = h.audit.start().unwrap();
        let mut rx = h.poller.subscribe();

        h.poller.start("cds", INTERVAL).await.unwrap();
        rx.changed().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        rx.changed().await.unwrap();
        rx.changed().await.unwrap();
        assert!(logs_contain("Failed to append CSV audit row"));
        assert!(h.poller.is_active());
        assert_eq!(h.poller.state(), PollState::Sampling);
        assert!(h.audit.is_enabled());

        h.poller.stop().await;
    }
}
