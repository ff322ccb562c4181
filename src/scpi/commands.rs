//! Typed sink operations.
//!
//! Each operation owns one connection for its whole lifetime:
//! open → command(s) → close. A transport error aborts the remaining
//! commands, the connection is still closed, and the error is returned.
//! Multi-step operations are not rolled back, so a failure halfway through
//! `set_voltage_priority_mode` can leave new current limits with the old
//! voltage level.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ScpiConnector, ScpiResponse, SinkPowerReading};
use crate::error::{BenchError, BenchResult};
use crate::interlock;
use crate::telemetry::TelemetrySample;

/// Quadratic loss model of a sink module: `loss(P) = a·P² + b·P + c`, P in kW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossCurve {
    /// Quadratic coefficient
    pub a: f64,
    /// Linear coefficient
    pub b: f64,
    /// Constant offset
    pub c: f64,
}

impl LossCurve {
    /// 2 kW sink module (the one fitted on the bench)
    pub const MODULE_2KW: LossCurve = LossCurve {
        a: 0.0035,
        b: 0.9858,
        c: 0.5878,
    };

    /// 10 kW sink module
    pub const MODULE_10KW: LossCurve = LossCurve {
        a: 0.0069,
        b: 1.0,
        c: 0.3884,
    };

    /// Power (kW) to command so that `power_kw` arrives after losses
    pub fn adjusted_power(&self, power_kw: f64) -> f64 {
        let loss = self.a * power_kw * power_kw + self.b * power_kw + self.c;
        2.0 * power_kw - loss
    }

    /// Current (A, two decimals) that draws `power_kw` at `voltage` V.
    ///
    /// Returns `None` unless `voltage` is a positive finite number.
    pub fn current_for_power(&self, power_kw: f64, voltage: f64) -> Option<f64> {
        if !(voltage.is_finite() && voltage > 0.0) {
            return None;
        }
        let current = self.adjusted_power(power_kw) * 1000.0 / voltage;
        Some((current * 100.0).round() / 100.0)
    }
}

/// Current for a power request, using the 2 kW module loss curve.
pub fn compute_current_for_power(power_kw: f64, voltage: f64) -> Option<f64> {
    LossCurve::MODULE_2KW.current_for_power(power_kw, voltage)
}

/// Render a number the way the sink expects it (`32`, `-32`, `12.5`).
fn scpi_number(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

/// Reject NaN and infinities before anything reaches the wire.
fn require_finite(name: &str, value: f64) -> BenchResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(BenchError::Configuration(format!(
            "{name} must be a finite number, got {value}"
        )))
    }
}

/// Current limits go in before the voltage level, so the sink never regulates
/// the new voltage against a stale limit.
fn voltage_priority_commands(voltage_limit: f64, current_limit: f64) -> Vec<String> {
    let max_current = current_limit.abs();
    vec![
        "SOUR:FUNC VOLT".to_string(),
        format!("SOUR:CURR:LIM:POS:IMM:AMPL {}", scpi_number(max_current)),
        format!("SOUR:CURR:LIM:NEG:IMM:AMPL {}", scpi_number(-max_current)),
        format!("SOUR:VOLT:LEV:IMM:AMPL {}", scpi_number(voltage_limit)),
    ]
}

fn current_priority_commands(current_limit: f64, voltage_limit: f64) -> Vec<String> {
    vec![
        "SOUR:FUNC CURR".to_string(),
        format!("SOUR:CURR {}", scpi_number(current_limit.abs())),
        format!("SOUR:VOLT:LIM:POS:IMM:AMPL {}", scpi_number(voltage_limit)),
    ]
}

fn output_command(enabled: bool) -> &'static str {
    if enabled {
        "OUTP ON"
    } else {
        "OUTP OFF"
    }
}

/// The SCPI command set for one bench.
///
/// Holds a view of the latest telemetry sample so that every energizing
/// request passes the safety interlock.
pub struct SinkController {
    connector: Arc<dyn ScpiConnector>,
    telemetry: watch::Receiver<TelemetrySample>,
}

impl SinkController {
    /// Create a controller using `connector` and gating on `telemetry`
    pub fn new(
        connector: Arc<dyn ScpiConnector>,
        telemetry: watch::Receiver<TelemetrySample>,
    ) -> Self {
        Self {
            connector,
            telemetry,
        }
    }

    fn latest_voltage(&self) -> i64 {
        self.telemetry.borrow().voltage_v
    }

    /// Open a connection, send `commands` in order, always close.
    async fn run(&self, host: &str, commands: &[String]) -> BenchResult<Vec<ScpiResponse>> {
        let mut link = self.connector.open(host).await?;

        let mut responses = Vec::with_capacity(commands.len());
        let mut outcome = Ok(());
        for command in commands {
            match link.send(command).await {
                Ok(response) => responses.push(response),
                Err(err) => {
                    warn!(
                        host,
                        command = %command,
                        error = %err,
                        "SCPI command failed; aborting sequence"
                    );
                    outcome = Err(err);
                    break;
                }
            }
        }

        link.close().await;
        outcome.map(|()| responses)
    }

    /// Switch to voltage priority (CV) mode.
    ///
    /// Sends the function, ±|current_limit| and then the voltage level.
    pub async fn set_voltage_priority_mode(
        &self,
        host: &str,
        voltage_limit: f64,
        current_limit: f64,
    ) -> BenchResult<()> {
        require_finite("voltage_limit", voltage_limit)?;
        require_finite("current_limit", current_limit)?;
        self.run(host, &voltage_priority_commands(voltage_limit, current_limit))
            .await?;
        info!(
            host,
            voltage_limit,
            current_limit = current_limit.abs(),
            "Sink set to voltage priority mode"
        );
        Ok(())
    }

    /// Switch to current priority (CC) mode with |current_limit| and a voltage limit.
    pub async fn set_current_priority_mode(
        &self,
        host: &str,
        current_limit: f64,
        voltage_limit: f64,
    ) -> BenchResult<()> {
        require_finite("current_limit", current_limit)?;
        require_finite("voltage_limit", voltage_limit)?;
        self.run(host, &current_priority_commands(current_limit, voltage_limit))
            .await?;
        info!(
            host,
            current = current_limit.abs(),
            voltage_limit,
            "Sink set to current priority mode"
        );
        Ok(())
    }

    /// Set the current level; the function mode must already be configured.
    ///
    /// Returns the value actually sent, which is 0 when the interlock fired.
    pub async fn set_current_setpoint(&self, host: &str, current: f64) -> BenchResult<f64> {
        require_finite("current", current)?;
        let voltage = self.latest_voltage();
        let gated = interlock::gate_current(voltage, current);
        if gated.downgraded {
            warn!(
                host,
                requested = current,
                voltage,
                "Voltage below interlock threshold; current setpoint forced to 0"
            );
        }

        self.run(host, &[format!("SOUR:CURR {}", scpi_number(gated.value))])
            .await?;
        info!(host, current = gated.value, "Current setpoint applied");
        Ok(gated.value)
    }

    /// Switch the output on or off.
    ///
    /// Returns the state actually sent, which is off when the interlock fired.
    pub async fn set_output(&self, host: &str, enabled: bool) -> BenchResult<bool> {
        let voltage = self.latest_voltage();
        let gated = interlock::gate_output(voltage, enabled);
        if gated.downgraded {
            warn!(host, voltage, "Voltage below interlock threshold; output forced OFF");
        }

        self.run(host, &[output_command(gated.value).to_string()])
            .await?;
        info!(host, on = gated.value, "Output state applied");
        Ok(gated.value)
    }

    /// Query the sink's measured power once.
    pub async fn sink_power(&self, host: &str) -> BenchResult<SinkPowerReading> {
        let mut responses = self.run(host, &["MEAS:POW?".to_string()]).await?;
        let response = responses.pop().unwrap_or_else(ScpiResponse::no_data);
        debug!(host, power = %response.msg, "Sink power");
        Ok(SinkPowerReading {
            successful: true,
            msg: response.msg,
        })
    }
}
