//! BAS controller daemon entry point.
//!
//! Builds the I/O controller from the configuration, registers the
//! built-in monitor plugin and drives the control cycle until a shutdown
//! signal or the cycle limit. SIGHUP re-reads the configuration file.

mod diagnostics;
mod monitor;
mod signals;

use anyhow::{Context, Result};
use bas_common::config::BasConfig;
use bas_fieldbus::simulated::SimulatedTransports;
use bas_fieldbus::{Endpoint, SystemTransports, TransportFactory};
use bas_runtime::{Controller, CycleDriver};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::diagnostics::{format_prometheus_metrics, DiagnosticsState};
use crate::monitor::MonitorPlugin;
use crate::signals::SignalHandler;

/// BAS controller daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "bas-daemon",
    about = "Building automation I/O controller - Modbus and on-board I/O dispatch",
    version,
    long_about = None
)]
struct Args {
    /// Path to a controller configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run against the in-memory simulated bus and I/O module.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Maximum cycles to run (0 = infinite).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Parse a symbolic address, print its canonical form and exit.
    #[arg(long, value_name = "ADDRESS")]
    check: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(address) = &args.check {
        println!("{}", canonical_address(address)?);
        return Ok(());
    }

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting BAS daemon");

    let (config, source) = load_config(&args)?;
    info!(
        cycle_ms = config.cycle_time.as_millis(),
        interfaces = config.interfaces.len(),
        local_pins = config.local.pins.len(),
        monitor_points = config.monitor.points.len(),
        simulated = args.simulated,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::install().context("Failed to set up signal handlers")?;

    let factory: Arc<dyn TransportFactory> = if args.simulated {
        info!("Using simulated transports");
        Arc::new(SimulatedTransports::default())
    } else {
        Arc::new(SystemTransports)
    };
    let controller =
        Controller::new(config.clone(), factory).context("Failed to build controller")?;

    let mut driver = CycleDriver::new(controller, &config);
    driver.add_plugin(Box::new(MonitorPlugin::new()));

    run_daemon(&mut driver, &signal_handler, source.as_deref(), args.max_cycles);
    Ok(())
}

/// Canonical form of a symbolic address.
fn canonical_address(address: &str) -> Result<String> {
    let endpoint =
        Endpoint::parse(address).with_context(|| format!("Invalid address {address:?}"))?;
    Ok(endpoint.to_string())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "bas_daemon={level},bas_runtime={level},bas_fieldbus={level},bas_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `BAS_CONFIG_PATH` environment variable
/// 3. `/etc/bas/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
///
/// Returns the path the configuration came from, used again on reload.
fn load_config(args: &Args) -> Result<(BasConfig, Option<PathBuf>)> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return read_config(config_path).map(|c| (c, Some(config_path.clone())));
    }

    if let Ok(env_path) = std::env::var("BAS_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from BAS_CONFIG_PATH");
            return read_config(&config_path).map(|c| (c, Some(config_path)));
        }
        warn!(
            path = %env_path,
            "BAS_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/bas/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return read_config(&config_path).map(|c| (c, Some(config_path)));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok((BasConfig::default(), None))
}

fn read_config(path: &Path) -> Result<BasConfig> {
    BasConfig::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// Re-read the configuration and apply it between cycles.
fn reload(driver: &mut CycleDriver, source: Option<&Path>) -> Result<()> {
    let Some(path) = source else {
        warn!("Reload requested but configuration came from built-in defaults");
        return Ok(());
    };
    let config = read_config(path)?;
    let period = config.cycle_time;
    let affected = driver
        .controller_mut()
        .reconfigure(config)
        .context("Rejected reloaded configuration")?;
    driver.set_cycle_period(period);
    info!(?path, ?affected, "Configuration reloaded");
    Ok(())
}

/// Main daemon run loop.
fn run_daemon(
    driver: &mut CycleDriver,
    signal_handler: &SignalHandler,
    source: Option<&Path>,
    max_cycles: u64,
) {
    let diagnostics = DiagnosticsState::new();
    let mut cycles_run = 0u64;

    info!(period_ms = driver.cycle_period().as_millis(), "Entering control loop");
    loop {
        if signal_handler.shutdown_requested() {
            info!("Shutdown signal received, stopping control loop");
            break;
        }

        if signal_handler.take_reload_request() {
            match reload(driver, source) {
                Ok(()) => diagnostics.record_reload(),
                Err(e) => error!(
                    error = %format!("{e:#}"),
                    "Configuration reload failed, keeping previous"
                ),
            }
        }

        match driver.run_cycle() {
            Ok(result) => diagnostics.record_cycle(&result),
            Err(e) => {
                error!(error = %e, "Cycle execution failed");
                break;
            }
        }

        cycles_run += 1;
        if max_cycles > 0 && cycles_run >= max_cycles {
            info!(cycles = cycles_run, "Maximum cycle count reached");
            break;
        }
    }

    info!("Shutting down...");
    diagnostics.set_shutting_down();

    let snapshot = diagnostics.snapshot(driver.controller().diagnostics(), driver.metrics());
    debug!(
        metrics = %format_prometheus_metrics(&snapshot, driver.cycle_period()),
        "Final metrics"
    );
    info!(
        total_cycles = snapshot.cycle_count,
        overruns = snapshot.overrun_count,
        transactions = snapshot.transactions,
        malfunctions = snapshot.malfunctions,
        failing_points = snapshot.failing_points,
        reloads = snapshot.reloads,
        signals = signal_handler.state().signal_count(),
        uptime_secs = snapshot.uptime.as_secs(),
        "Daemon shutdown complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::io::Write;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["bas-daemon", "--simulated"]);
        assert!(args.simulated);
        assert!(args.config.is_none());
        assert_eq!(args.max_cycles, 0);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_with_config() {
        let args = Args::parse_from(["bas-daemon", "-c", "site.toml", "--max-cycles", "10"]);
        assert_eq!(args.config, Some(PathBuf::from("site.toml")));
        assert_eq!(args.max_cycles, 10);
    }

    #[test]
    fn test_check_canonical_form() {
        let args = Args::parse_from(["bas-daemon", "--check", "DI03"]);
        assert_eq!(args.check.as_deref(), Some("DI03"));
        assert_eq!(canonical_address("DI03").unwrap(), "DI3");
        assert_eq!(canonical_address("!RO1").unwrap(), "!RO1");
        assert!(canonical_address("XX1").is_err());
    }

    #[test]
    fn test_load_explicit_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cycle_time = \"250ms\"").unwrap();
        let args = Args::parse_from([
            OsStr::new("bas-daemon"),
            OsStr::new("-c"),
            file.path().as_os_str(),
        ]);
        let (config, source) = load_config(&args).unwrap();
        assert_eq!(config.cycle_time.as_millis(), 250);
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_reload_applies_new_period() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cycle_time = \"2ms\"").unwrap();

        let config = BasConfig::default();
        let controller =
            Controller::new(config.clone(), Arc::new(SimulatedTransports::default())).unwrap();
        let mut driver = CycleDriver::new(controller, &config);

        reload(&mut driver, Some(file.path())).unwrap();
        assert_eq!(driver.cycle_period().as_millis(), 2);
        assert!(reload(&mut driver, None).is_ok());
    }

    #[test]
    fn test_bounded_run() {
        let config = BasConfig {
            cycle_time: std::time::Duration::from_millis(1),
            ..BasConfig::default()
        };
        let controller =
            Controller::new(config.clone(), Arc::new(SimulatedTransports::default())).unwrap();
        let mut driver = CycleDriver::new(controller, &config);
        run_daemon(&mut driver, &SignalHandler::detached(), None, 3);
        assert_eq!(driver.cycle_count(), 3);
    }
}
