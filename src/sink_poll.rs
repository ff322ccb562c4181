//! Fixed-rate sink power readback.
//!
//! Independent of the telemetry loop: every `interval` the sink is asked for
//! `MEAS:POW?` and the result becomes the latest [`SinkPowerReading`]. Only one
//! loop runs at a time; starting again while active does nothing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::{BenchError, BenchResult};
use crate::scpi::{SinkController, SinkPowerReading};

/// Periodic `MEAS:POW?` poller.
pub struct SinkPowerPoller {
    controller: Arc<SinkController>,
    latest: Arc<watch::Sender<SinkPowerReading>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SinkPowerPoller {
    /// Create an idle poller publishing to `latest`
    pub fn new(controller: Arc<SinkController>, latest: watch::Sender<SinkPowerReading>) -> Self {
        Self {
            controller,
            latest: Arc::new(latest),
            task: Mutex::new(None),
        }
    }

    /// Start polling `host` every `interval`.
    ///
    /// Returns `Ok(false)` without starting anything if a loop is already
    /// running. `_timeout` is accepted for callers that already pass one; the
    /// per-query window is the SCPI response timeout.
    pub async fn start(
        &self,
        host: &str,
        interval: Duration,
        _timeout: Duration,
    ) -> BenchResult<bool> {
        if interval.is_zero() {
            return Err(BenchError::Configuration(
                "sink polling interval must be > 0".into(),
            ));
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let controller = Arc::clone(&self.controller);
        let latest = Arc::clone(&self.latest);
        let host = host.to_string();
        info!(
            host = %host,
            interval_ms = interval.as_millis() as u64,
            "Sink power polling started"
        );

        *task = Some(tokio::spawn(async move {
            // First query one period after start, like any fixed-rate timer.
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match controller.sink_power(&host).await {
                    Ok(reading) => {
                        latest.send_replace(reading);
                    }
                    Err(err) => {
                        warn!(host = %host, error = %err, "Sink power query failed");
                        latest.send_modify(|reading| reading.successful = false);
                    }
                }
            }
        }));
        Ok(true)
    }

    /// Cancel the loop. The latest reading is kept.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("Sink power polling stopped");
        }
    }

    /// True while a loop is running
    pub async fn is_active(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Latest readback
    pub fn latest(&self) -> SinkPowerReading {
        self.latest.borrow().clone()
    }

    /// Watch readbacks
    pub fn subscribe(&self) -> watch::Receiver<SinkPowerReading> {
        self.latest.subscribe()
    }
}

impl Drop for SinkPowerPoller {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
