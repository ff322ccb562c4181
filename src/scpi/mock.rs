//! Mock SCPI sink
//!
//! Records every command per connection so tests can assert on exact command
//! sequences, and backs the `--simulate` mode of the binary.
//!
//! - `*IDN?` answers with a fixed identity
//! - `MEAS:POW?` answers with a configurable power string
//! - every other command gets no reply, like the real sink's setters
//!
//! Failures can be injected on any command prefix or at connect time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{ScpiConnector, ScpiLink, ScpiResponse};
use crate::error::{BenchError, BenchResult};

const MOCK_IDENTITY: &str = "Mock Sink,PSB 10060-1000,SN000001,1.0.0";

#[derive(Debug, Default)]
struct MockState {
    sessions: Vec<Vec<String>>,
    opened: usize,
    closed: usize,
    fail_on: Option<String>,
    refuse_connect: bool,
    power_response: String,
}

/// In-memory SCPI sink; clones share the same recorded state.
#[derive(Debug, Clone)]
pub struct MockScpiConnector {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockScpiConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScpiConnector {
    /// Mock sink reporting 0 W
    pub fn new() -> Self {
        Self::with_power("0")
    }

    /// Mock sink answering `MEAS:POW?` with `response`
    pub fn with_power(response: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                power_response: response.to_string(),
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the `MEAS:POW?` response
    pub fn set_power(&self, response: &str) {
        self.state().power_response = response.to_string();
    }

    /// Fail every command starting with `prefix` with a connection reset
    pub fn fail_on(&self, prefix: &str) {
        self.state().fail_on = Some(prefix.to_string());
    }

    /// Stop injecting command failures
    pub fn clear_failures(&self) {
        self.state().fail_on = None;
    }

    /// Refuse (or accept again) new connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Commands per connection, in order, including `*IDN?`
    pub fn sessions(&self) -> Vec<Vec<String>> {
        self.state().sessions.clone()
    }

    /// All commands across connections, without the `*IDN?` handshakes
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .sessions
            .iter()
            .flatten()
            .filter(|c| c.as_str() != "*IDN?")
            .cloned()
            .collect()
    }

    /// Number of commands sent that start with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .sessions
            .iter()
            .flatten()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Connections opened successfully
    pub fn opened(&self) -> usize {
        self.state().opened
    }

    /// Connections closed
    pub fn closed(&self) -> usize {
        self.state().closed
    }
}

#[async_trait]
impl ScpiConnector for MockScpiConnector {
    async fn open(&self, host: &str) -> BenchResult<Box<dyn ScpiLink>> {
        let index = {
            let mut state = self.state();
            if state.refuse_connect {
                return Err(BenchError::Connect {
                    host: host.to_string(),
                    port: super::SCPI_PORT,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            state.sessions.push(Vec::new());
            state.sessions.len() - 1
        };

        let mut link = MockScpiLink {
            state: Arc::clone(&self.state),
            index,
            closed: false,
        };
        if let Err(err) = link.send("*IDN?").await {
            link.close().await;
            return Err(BenchError::Identification {
                host: host.to_string(),
                reason: err.to_string(),
            });
        }

        self.state().opened += 1;
        debug!(host, "Mock SCPI connection opened");
        Ok(Box::new(link))
    }
}

struct MockScpiLink {
    state: Arc<Mutex<MockState>>,
    index: usize,
    closed: bool,
}

#[async_trait]
impl ScpiLink for MockScpiLink {
    async fn send(&mut self, command: &str) -> BenchResult<ScpiResponse> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sessions[self.index].push(command.to_string());

        if state
            .fail_on
            .as_deref()
            .is_some_and(|prefix| command.starts_with(prefix))
        {
            return Err(BenchError::Transport {
                command: command.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            });
        }

        Ok(match command {
            "*IDN?" => ScpiResponse::data(MOCK_IDENTITY),
            "MEAS:POW?" => ScpiResponse::data(&state.power_response),
            _ => ScpiResponse::no_data(),
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .closed += 1;
        }
    }
}
