//! RTC sync entry point.
//!
//! Reads each configured device clock over Modbus TCP, writes host time back
//! and verifies the result. Per-device failures are reported, never fatal.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rtc_common::{
    host_time_as_device_epoch, DeviceTarget, DeviceTimestamp, SyncConfig, SystemClock,
};
use rtc_fieldbus::{ModbusTcpClient, ModbusTcpConfig, RegisterTransport, SimulatedClockDevice};
use rtc_syncer::{report, ClockSyncer, DeviceReport};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming a config file.
const CONFIG_ENV: &str = "RTC_SYNC_CONFIG";

/// Seconds a simulated device clock lags host time.
const SIMULATED_DRIFT_SECS: u32 = 90;

/// Report format on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per device.
    Json,
}

/// RTC sync command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "rtc-sync",
    about = "Synchronize Modbus TCP device clocks to host time",
    version,
    long_about = None
)]
struct Args {
    /// Path to a sync configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device to sync as host[:port][/unit]. Repeatable; replaces the configured list.
    #[arg(long = "device", short = 'd', value_name = "TARGET")]
    devices: Vec<DeviceTarget>,

    /// Also write the millisecond register.
    #[arg(long)]
    write_ms: bool,

    /// Send each target's unit id instead of the default unit id.
    #[arg(long)]
    apply_unit_id: bool,

    /// Sync in-memory simulated devices instead of real hardware.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Report format.
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rtc-sync");

    let env_path = std::env::var(CONFIG_ENV).ok();
    let mut config = load_config(args.config.as_deref(), env_path.as_deref())?;
    apply_overrides(&mut config, &args)?;

    info!(
        devices = config.devices.len(),
        timeout = ?config.timeout,
        write_ms = config.registers.write_ms_enabled,
        "Configuration loaded"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    sync_all(&config, &args, &mut out)?;
    Ok(())
}

/// Initialize logging on stderr, leaving stdout for the report.
fn init_logging(level: &str) {
    let filter = format!(
        "rtc_sync={level},rtc_syncer={level},rtc_fieldbus={level},rtc_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority:
/// 1. Command-line `--config` argument
/// 2. `RTC_SYNC_CONFIG` environment variable
/// 3. Built-in defaults
fn load_config(cli_path: Option<&Path>, env_path: Option<&str>) -> Result<SyncConfig> {
    if let Some(config_path) = cli_path {
        info!(?config_path, "Loading config from command-line argument");
        return SyncConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Some(env_path) = env_path {
        let config_path = PathBuf::from(env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from {CONFIG_ENV}");
            return SyncConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(path = %env_path, "{CONFIG_ENV} set but file does not exist, using defaults");
    }

    info!("No config file given, using built-in defaults");
    Ok(SyncConfig::default())
}

/// Fold command-line flags into the loaded configuration.
fn apply_overrides(config: &mut SyncConfig, args: &Args) -> Result<()> {
    if !args.devices.is_empty() {
        config.devices.clone_from(&args.devices);
    }
    if args.write_ms {
        config.registers.write_ms_enabled = true;
    }
    if args.apply_unit_id {
        config.apply_unit_id = true;
    }
    config.validate().context("Invalid configuration")
}

/// Build the transport for one target.
fn connect_target(
    config: &SyncConfig,
    simulated: bool,
    target: &DeviceTarget,
) -> Box<dyn RegisterTransport> {
    if simulated {
        let host = host_time_as_device_epoch(&SystemClock);
        let drifted = DeviceTimestamp::new(
            host.epoch_seconds_2000.saturating_sub(SIMULATED_DRIFT_SECS),
            host.milliseconds,
        );
        Box::new(SimulatedClockDevice::with_registers(config.registers.clone(), drifted))
    } else {
        Box::new(ModbusTcpClient::new(ModbusTcpConfig::for_target(target, config)))
    }
}

/// Sync every configured device and print each report as it completes.
fn sync_all<W: Write>(config: &SyncConfig, args: &Args, out: &mut W) -> Result<Vec<DeviceReport>> {
    let syncer = ClockSyncer::new(config);

    if args.format == OutputFormat::Text {
        report::write_banner(&mut *out, syncer.registers(), config.devices.len())
            .context("Failed to write report")?;
    }

    let mut write_result = Ok(());
    let reports = syncer.run(
        &config.devices,
        |target| connect_target(config, args.simulated, target),
        |device_report| {
            if write_result.is_err() {
                return;
            }
            write_result = match args.format {
                OutputFormat::Text => {
                    report::write_text(&mut *out, syncer.registers(), device_report)
                }
                OutputFormat::Json => report::write_json(&mut *out, device_report),
            };
        },
    );
    write_result.context("Failed to write report")?;
    out.flush().context("Failed to write report")?;

    Ok(reports)
}
