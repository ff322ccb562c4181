//! Bench configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the bench's shipped setup)
//! 2. A TOML file (`config/load_bench.toml` unless another path is given)
//! 3. Environment variables prefixed with `LOAD_BENCH_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use load_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! println!("Voltage sink: {}", config.sink.voltage_host);
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! `LOAD_BENCH_CDS__POLL_INTERVAL_MS=250` overrides `cds.poll_interval_ms`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BenchError, BenchResult};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/load_bench.toml";

/// Top-level bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// SCPI power sinks
    pub sink: SinkConfig,
    /// CDS telemetry adapter
    pub cds: CdsConfig,
    /// Sink power readback loop
    pub sink_polling: SinkPollingConfig,
    /// CSV audit log output
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// SCPI sink configuration.
///
/// The bench drives two sinks: one in voltage priority mode and one in current
/// priority mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Host of the sink operated in voltage priority mode
    pub voltage_host: String,
    /// Host of the sink operated in current priority mode
    pub current_host: String,
    /// SCPI raw socket port
    #[serde(default = "default_scpi_port")]
    pub port: u16,
    /// Response window for a single command in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Voltage limit in V
    pub voltage_limit: f64,
    /// Current limit in A
    pub current_limit: f64,
    /// Largest power request the operator may dial in, in kW
    pub max_kw: f64,
}

/// CDS telemetry adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdsConfig {
    /// Adapter host
    pub host: String,
    /// Adapter port
    #[serde(default = "default_cds_port")]
    pub port: u16,
    /// Delay between the end of one telemetry tick and the start of the next
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Wait after tearing down a session before a new one is opened
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

/// Sink power readback loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkPollingConfig {
    /// Fixed tick period in milliseconds
    #[serde(default = "default_sink_interval")]
    pub interval_ms: u64,
    /// Reserved; accepted and validated but not applied yet
    #[serde(default = "default_sink_timeout")]
    pub timeout_ms: u64,
}

/// CSV audit log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving `measurements_<timestamp>.csv` files
    pub output_dir: PathBuf,
}

fn default_scpi_port() -> u16 {
    crate::scpi::SCPI_PORT
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_cds_port() -> u16 {
    crate::telemetry::CDS_PORT
}

fn default_poll_interval() -> u64 {
    400
}

fn default_settle_delay() -> u64 {
    100
}

fn default_sink_interval() -> u64 {
    1000
}

fn default_sink_timeout() -> u64 {
    3000
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "AC Dynamic Load".to_string(),
                log_level: "info".to_string(),
            },
            sink: SinkConfig {
                voltage_host: "192.168.100.180".to_string(),
                current_host: "192.168.100.182".to_string(),
                port: default_scpi_port(),
                response_timeout_ms: default_response_timeout(),
                voltage_limit: 692.0,
                current_limit: 32.0,
                max_kw: 22.0,
            },
            cds: CdsConfig {
                host: "192.168.100.80".to_string(),
                port: default_cds_port(),
                poll_interval_ms: default_poll_interval(),
                settle_delay_ms: default_settle_delay(),
            },
            sink_polling: SinkPollingConfig {
                interval_ms: default_sink_interval(),
                timeout_ms: default_sink_timeout(),
            },
            storage: StorageConfig {
                output_dir: PathBuf::from("data"),
            },
        }
    }
}

impl BenchConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOAD_BENCH_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, host) in [
            ("sink.voltage_host", &self.sink.voltage_host),
            ("sink.current_host", &self.sink.current_host),
            ("cds.host", &self.cds.host),
        ] {
            if host.trim().is_empty() {
                return Err(BenchError::Configuration(format!("{name} must not be empty")));
            }
        }

        if self.sink.port == 0 || self.cds.port == 0 {
            return Err(BenchError::Configuration("Ports must be non-zero".into()));
        }

        for (name, value) in [
            ("sink.response_timeout_ms", self.sink.response_timeout_ms),
            ("cds.poll_interval_ms", self.cds.poll_interval_ms),
            ("sink_polling.interval_ms", self.sink_polling.interval_ms),
            ("sink_polling.timeout_ms", self.sink_polling.timeout_ms),
        ] {
            if value == 0 {
                return Err(BenchError::Configuration(format!("{name} must be > 0")));
            }
        }

        for (name, value) in [
            ("sink.voltage_limit", self.sink.voltage_limit),
            ("sink.current_limit", self.sink.current_limit),
            ("sink.max_kw", self.sink.max_kw),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(BenchError::Configuration(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// SCPI response window
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.sink.response_timeout_ms)
    }

    /// Telemetry poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cds.poll_interval_ms)
    }

    /// Settle delay between telemetry sessions
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.cds.settle_delay_ms)
    }

    /// Sink power readback period
    pub fn sink_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sink_polling.interval_ms)
    }

    /// Reserved sink poll timeout
    pub fn sink_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_polling.timeout_ms)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
