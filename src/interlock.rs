//! Safety interlock for energizing commands.
//!
//! The sink must not be energized while the device under test reports less
//! than [`MIN_OUTPUT_VOLTAGE`]. Requests are not rejected: they are rewritten
//! to their safe value (output off, current 0) and the command is still sent.
//! Decisions use the most recent telemetry sample only.

/// Minimum measured voltage (V) required to enable the output or raise current.
pub const MIN_OUTPUT_VOLTAGE: i64 = 200;

/// Result of consulting the interlock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gated<T> {
    /// Value to send to the sink
    pub value: T,
    /// True when the request was replaced by its safe value
    pub downgraded: bool,
}

/// True when `voltage` is high enough to energize the sink.
pub fn voltage_permits(voltage: i64) -> bool {
    voltage >= MIN_OUTPUT_VOLTAGE
}

/// Gate an output-state request.
pub fn gate_output(latest_voltage: i64, requested: bool) -> Gated<bool> {
    if requested && !voltage_permits(latest_voltage) {
        Gated {
            value: false,
            downgraded: true,
        }
    } else {
        Gated {
            value: requested,
            downgraded: false,
        }
    }
}

/// Gate a current setpoint request.
pub fn gate_current(latest_voltage: i64, requested: f64) -> Gated<f64> {
    if !voltage_permits(latest_voltage) && requested != 0.0 {
        Gated {
            value: 0.0,
            downgraded: true,
        }
    } else {
        Gated {
            value: requested,
            downgraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_forced_off_below_threshold() {
        for voltage in [-50, 0, 1, 150, 199] {
            let gated = gate_output(voltage, true);
            assert!(!gated.value, "voltage {voltage} must not enable output");
            assert!(gated.downgraded);
        }
    }

    #[test]
    fn output_passes_at_and_above_threshold() {
        assert_eq!(
            gate_output(200, true),
            Gated {
                value: true,
                downgraded: false
            }
        );
        assert!(gate_output(230, true).value);
    }

    #[test]
    fn output_off_is_never_downgraded() {
        let gated = gate_output(0, false);
        assert!(!gated.value);
        assert!(!gated.downgraded);
    }

    #[test]
    fn current_forced_to_zero_below_threshold() {
        let gated = gate_current(120, 16.0);
        assert_eq!(gated.value, 0.0);
        assert!(gated.downgraded);

        assert_eq!(gate_current(199, 0.0).value, 0.0);
        assert!(!gate_current(199, 0.0).downgraded);
    }

    #[test]
    fn current_passes_with_valid_voltage() {
        let gated = gate_current(400, 16.5);
        assert_eq!(gated.value, 16.5);
        assert!(!gated.downgraded);
    }
}
