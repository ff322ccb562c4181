//! CLI entry point for the load bench
//!
//! Provides command-line access to:
//! - Monitoring (telemetry polling, sink power readback, optional CSV audit log)
//! - One-shot sink control (output, modes, current setpoint, power readback)
//! - One-shot CDS channel reads
//!
//! # Usage
//!
//! ```bash
//! load-bench monitor --csv
//! load-bench output on --sink current
//! load-bench --simulate setpoint 16
//! ```
//!
//! `--simulate` replaces both sinks and the CDS adapter with in-memory mocks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use load_bench::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use load_bench::logging::{self, OutputFormat, TracingConfig};
use load_bench::scpi::mock::MockScpiConnector;
use load_bench::scpi::{ScpiConnector, TcpScpiConnector};
use load_bench::telemetry::mock::MockCdsConnector;
use load_bench::telemetry::{CdsConnector, Channel, UnlinkedCdsConnector};
use load_bench::LoadBench;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SIMULATED_SINK_POWER: &str = "1234.5";
const FIRST_SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "load-bench")]
#[command(about = "AC load bench control and monitoring", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use in-memory sinks and CDS adapter instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Which of the two sinks a command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sink {
    /// Sink run in voltage priority mode
    Voltage,
    /// Sink run in current priority mode
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputState {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll telemetry and sink power until Ctrl-C
    Monitor {
        /// Write a CSV audit log while monitoring
        #[arg(long)]
        csv: bool,

        /// Sink whose power is read back
        #[arg(long, value_enum, default_value = "voltage")]
        sink: Sink,
    },

    /// Switch a sink output on or off (interlocked)
    Output {
        #[arg(value_enum)]
        state: OutputState,

        #[arg(long, value_enum, default_value = "current")]
        sink: Sink,
    },

    /// Put the voltage sink in voltage priority mode
    VoltageMode {
        /// Voltage level (V); defaults to sink.voltage_limit
        #[arg(long)]
        voltage: Option<f64>,

        /// Current limit (A); defaults to sink.current_limit
        #[arg(long)]
        current_limit: Option<f64>,
    },

    /// Put the current sink in current priority mode
    CurrentMode {
        /// Current level (A); defaults to sink.current_limit
        #[arg(long)]
        current: Option<f64>,

        /// Voltage limit (V); defaults to sink.voltage_limit
        #[arg(long)]
        voltage_limit: Option<f64>,
    },

    /// Set the current level of a sink (interlocked)
    Setpoint {
        /// Current (A)
        current: f64,

        #[arg(long, value_enum, default_value = "current")]
        sink: Sink,
    },

    /// Read a sink's measured power once
    SinkPower {
        #[arg(long, value_enum, default_value = "voltage")]
        sink: Sink,
    },

    /// Current needed to draw a power at a voltage
    CurrentForPower {
        /// Power (kW)
        power_kw: f64,

        /// Voltage (V)
        voltage: f64,
    },

    /// Read one CDS channel with a short-lived session
    ReadChannel {
        #[arg(value_enum)]
        channel: Channel,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let tracing_config = TracingConfig::from_bench_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    info!(name = %config.application.name, simulate = cli.simulate, "Load bench starting");

    let (scpi, cds) = connectors(&config, cli.simulate);
    let bench = LoadBench::new(config, scpi, cds);

    let result = run(&bench, cli.command).await;
    bench.shutdown().await;
    result
}

fn connectors(
    config: &BenchConfig,
    simulate: bool,
) -> (Arc<dyn ScpiConnector>, Arc<dyn CdsConnector>) {
    if simulate {
        return (
            Arc::new(MockScpiConnector::with_power(SIMULATED_SINK_POWER)),
            Arc::new(MockCdsConnector::steady(400.0, 6400.0, 16.0)),
        );
    }

    // The CDS driver ships separately; without it the interlock keeps the
    // sinks de-energized.
    (
        Arc::new(TcpScpiConnector::new(
            config.sink.port,
            config.response_timeout(),
        )),
        Arc::new(UnlinkedCdsConnector),
    )
}

fn sink_host(config: &BenchConfig, sink: Sink) -> String {
    match sink {
        Sink::Voltage => config.sink.voltage_host.clone(),
        Sink::Current => config.sink.current_host.clone(),
    }
}

async fn run(bench: &LoadBench, command: Commands) -> Result<()> {
    let config = bench.config().clone();

    match command {
        Commands::Monitor { csv, sink } => monitor(bench, csv, &sink_host(&config, sink)).await,
        Commands::Output { state, sink } => {
            prime_telemetry(bench).await;
            let sent = bench
                .set_output(&sink_host(&config, sink), state == OutputState::On)
                .await?;
            println!("Output {}", if sent { "ON" } else { "OFF" });
            Ok(())
        }
        Commands::VoltageMode {
            voltage,
            current_limit,
        } => {
            let voltage = voltage.unwrap_or(config.sink.voltage_limit);
            let current_limit = current_limit.unwrap_or(config.sink.current_limit);
            bench
                .set_voltage_priority_mode(&config.sink.voltage_host, voltage, current_limit)
                .await?;
            println!("Voltage priority: {voltage} V, ±{} A", current_limit.abs());
            Ok(())
        }
        Commands::CurrentMode {
            current,
            voltage_limit,
        } => {
            let current = current.unwrap_or(config.sink.current_limit);
            let voltage_limit = voltage_limit.unwrap_or(config.sink.voltage_limit);
            bench
                .set_current_priority_mode(&config.sink.current_host, current, voltage_limit)
                .await?;
            println!("Current priority: {} A, limit {voltage_limit} V", current.abs());
            Ok(())
        }
        Commands::Setpoint { current, sink } => {
            prime_telemetry(bench).await;
            let sent = bench
                .set_current_setpoint(&sink_host(&config, sink), current)
                .await?;
            println!("Current setpoint {sent} A");
            Ok(())
        }
        Commands::SinkPower { sink } => {
            let reading = bench.sink_power_once(&sink_host(&config, sink)).await?;
            match reading.watts() {
                Some(watts) => println!("Sink power {watts} W"),
                None => println!("Sink power: {}", reading.msg),
            }
            Ok(())
        }
        Commands::CurrentForPower { power_kw, voltage } => {
            let current = bench
                .compute_current_for_power(power_kw, voltage)
                .context("voltage must be a positive number")?;
            println!("{current:.2} A");
            Ok(())
        }
        Commands::ReadChannel { channel } => {
            let value = bench.read_channel_once(&config.cds.host, channel).await?;
            println!("{channel:?} = {value}");
            Ok(())
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Start telemetry and wait for the first sample so the interlock sees a real
/// voltage. Without one the interlock treats the voltage as 0.
async fn prime_telemetry(bench: &LoadBench) {
    let config = bench.config();
    let mut samples = bench.subscribe_samples();

    if let Err(err) = bench
        .start_telemetry(&config.cds.host, config.poll_interval())
        .await
    {
        warn!(error = %err, "Telemetry unavailable; interlock will de-energize");
        return;
    }

    match tokio::time::timeout(FIRST_SAMPLE_TIMEOUT, samples.changed()).await {
        Ok(Ok(())) => {
            let sample = bench.latest_sample();
            info!(voltage_v = sample.voltage_v, "Telemetry primed");
        }
        _ => warn!("No telemetry sample received; interlock will de-energize"),
    }
}

async fn monitor(bench: &LoadBench, csv: bool, sink_host: &str) -> Result<()> {
    let config = bench.config();

    if let Err(err) = bench
        .start_telemetry(&config.cds.host, config.poll_interval())
        .await
    {
        warn!(error = %err, "Telemetry polling not started");
    }
    bench
        .start_sink_polling(
            sink_host,
            config.sink_poll_interval(),
            config.sink_poll_timeout(),
        )
        .await?;

    if csv {
        let path = bench.start_csv_logging()?;
        println!("Logging to {}", path.display());
    }

    println!("Monitoring; press Ctrl-C to stop");
    let mut status = tokio::time::interval(STATUS_PERIOD);
    loop {
        tokio::select! {
            _ = status.tick() => {
                let sample = bench.latest_sample();
                let sink = bench.sink_power_reading();
                info!(
                    state = ?bench.telemetry_state(),
                    voltage_v = sample.voltage_v,
                    current_a = sample.current_a,
                    power_w = sample.power_w,
                    sink_power = %sink.msg,
                    sink_ok = sink.successful,
                    "Bench status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    if let Some(path) = bench.stop_csv_logging() {
        println!("CSV written to {}", path.display());
    }
    Ok(())
}
