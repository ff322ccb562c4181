//! Mock CDS adapter
//!
//! Scripted telemetry source for tests and `--simulate` mode:
//! - steady per-channel values, optionally preceded by a queue of scripted values
//! - per-channel read failures, start and teardown failures
//! - a log of read order
//! - a count of concurrently open adapter connections (and the peak)

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{CdsAdapter, CdsConnector, Channel};
use crate::error::{BenchError, BenchResult};

#[derive(Debug, Default)]
struct MockCdsState {
    steady: HashMap<Channel, f64>,
    scripted: HashMap<Channel, VecDeque<f64>>,
    failing: HashSet<Channel>,
    fail_teardown: bool,
    fail_start: bool,
    refuse_connect: bool,
    reads: Vec<(u8, u8)>,
    connects: usize,
    open_sessions: usize,
    max_open_sessions: usize,
    started_sessions: usize,
}

fn lock(state: &Mutex<MockCdsState>) -> MutexGuard<'_, MockCdsState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted CDS adapter; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockCdsConnector {
    state: Arc<Mutex<MockCdsState>>,
}

impl MockCdsConnector {
    /// Adapter without any channel values; reads fail until values are set
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter reporting constant voltage, power and current
    pub fn steady(voltage: f64, power: f64, current: f64) -> Self {
        let mock = Self::new();
        mock.set_value(Channel::VoltageL1, voltage);
        mock.set_value(Channel::RealPower, power);
        mock.set_value(Channel::CurrentL1, current);
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockCdsState> {
        lock(&self.state)
    }

    /// Set the value returned once the scripted queue for `channel` is empty
    pub fn set_value(&self, channel: Channel, value: f64) {
        self.state().steady.insert(channel, value);
    }

    /// Queue values returned by the next reads of `channel`, one per read
    pub fn push_values(&self, channel: Channel, values: &[f64]) {
        self.state()
            .scripted
            .entry(channel)
            .or_default()
            .extend(values.iter().copied());
    }

    /// Make reads of `channel` fail (or succeed again)
    pub fn fail_channel(&self, channel: Channel, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing.insert(channel);
        } else {
            state.failing.remove(&channel);
        }
    }

    /// Make `start_session` report an error
    pub fn fail_start_session(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    /// Make `stop_session` and `disconnect` report errors
    pub fn fail_teardown(&self, fail: bool) {
        self.state().fail_teardown = fail;
    }

    /// Refuse (or accept again) new connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Raw `(group, index)` addresses read so far, in order
    pub fn reads(&self) -> Vec<(u8, u8)> {
        self.state().reads.clone()
    }

    /// Known channels read so far, in order
    pub fn read_channels(&self) -> Vec<Channel> {
        self.state()
            .reads
            .iter()
            .filter_map(|&(group, index)| Channel::from_address(group, index))
            .collect()
    }

    /// Successful connects so far
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Global-status subscriptions started so far
    pub fn started_sessions(&self) -> usize {
        self.state().started_sessions
    }

    /// Adapter connections currently open
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// Most adapter connections ever open at the same time
    pub fn max_open_sessions(&self) -> usize {
        self.state().max_open_sessions
    }
}

#[async_trait]
impl CdsConnector for MockCdsConnector {
    async fn connect(&self, host: &str, port: u16) -> BenchResult<Box<dyn CdsAdapter>> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(BenchError::telemetry(
                "connect",
                format!("connection to {host}:{port} refused"),
            ));
        }
        state.connects += 1;
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);

        Ok(Box::new(MockCdsAdapter {
            state: Arc::clone(&self.state),
            connected: true,
        }))
    }
}

struct MockCdsAdapter {
    state: Arc<Mutex<MockCdsState>>,
    connected: bool,
}

impl MockCdsAdapter {
    fn release(&mut self) {
        if self.connected {
            self.connected = false;
            lock(&self.state).open_sessions -= 1;
        }
    }
}

impl Drop for MockCdsAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl CdsAdapter for MockCdsAdapter {
    async fn start_session(&mut self) -> BenchResult<()> {
        let mut state = lock(&self.state);
        if state.fail_start {
            return Err(BenchError::telemetry("start_session", "global status rejected"));
        }
        state.started_sessions += 1;
        Ok(())
    }

    async fn read_value(&mut self, group: u8, index: u8) -> BenchResult<f64> {
        if !self.connected {
            return Err(BenchError::telemetry("read", "adapter disconnected"));
        }

        let mut state = lock(&self.state);
        state.reads.push((group, index));

        let channel = Channel::from_address(group, index).ok_or_else(|| {
            BenchError::telemetry("read", format!("unknown channel {group:#04x}/{index:#04x}"))
        })?;
        if state.failing.contains(&channel) {
            return Err(BenchError::telemetry(
                "read",
                format!("{channel:?} read timed out"),
            ));
        }

        if let Some(value) = state.scripted.get_mut(&channel).and_then(VecDeque::pop_front) {
            return Ok(value);
        }
        state
            .steady
            .get(&channel)
            .copied()
            .ok_or_else(|| BenchError::telemetry("read", format!("{channel:?} has no value")))
    }

    async fn stop_session(&mut self) -> BenchResult<()> {
        if lock(&self.state).fail_teardown {
            return Err(BenchError::telemetry("stop_session", "adapter did not acknowledge"));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> BenchResult<()> {
        // The handle is released even when the adapter reports an error.
        self.release();
        if lock(&self.state).fail_teardown {
            return Err(BenchError::telemetry("disconnect", "socket already reset"));
        }
        Ok(())
    }
}
