//! Health summary and metrics export for the daemon.
//!
//! The cycle loop feeds [`DiagnosticsState`] after every cycle; a
//! [`DiagnosticsSnapshot`] combines it with the controller's error mirror
//! and the cycle metrics for logging or Prometheus text exposition.

use bas_common::metrics::CycleMetrics;
use bas_runtime::{CycleResult, IoDiagnostics};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Consecutive cycles with failed groups before the daemon reports unhealthy.
const UNHEALTHY_AFTER_FAILING_CYCLES: u64 = 3;

/// Health status of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// All points updating, cycle on time.
    Healthy,
    /// Some points failing or cycles overrunning.
    Degraded,
    /// Bus failures in several consecutive cycles.
    Unhealthy,
    /// No cycle completed yet.
    Starting,
    /// Shutdown in progress.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Snapshot of daemon diagnostics at a point in time.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Current health status.
    pub health: HealthStatus,
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Number of cycle overruns.
    pub overrun_count: u64,
    /// Uptime since daemon start.
    pub uptime: Duration,
    /// Last cycle execution time.
    pub last_cycle_time: Option<Duration>,
    /// Average cycle time.
    pub avg_cycle_time: Option<Duration>,
    /// Maximum cycle time observed.
    pub max_cycle_time: Option<Duration>,
    /// Physical transactions issued.
    pub transactions: u64,
    /// Hardware malfunctions logged.
    pub malfunctions: u64,
    /// Points whose last update failed.
    pub failing_points: usize,
    /// Configuration reloads applied.
    pub reloads: u64,
}

/// Counters updated by the cycle loop.
#[derive(Debug)]
pub struct DiagnosticsState {
    cycle_count: AtomicU64,
    overrun_count: AtomicU64,
    last_cycle_ns: AtomicU64,
    failing_cycles: AtomicU64,
    reloads: AtomicU64,
    shutting_down: AtomicBool,
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Create new diagnostics state.
    pub fn new() -> Self {
        Self {
            cycle_count: AtomicU64::new(0),
            overrun_count: AtomicU64::new(0),
            last_cycle_ns: AtomicU64::new(0),
            failing_cycles: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    /// Record a completed cycle.
    pub fn record_cycle(&self, result: &CycleResult) {
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_ns.store(
            u64::try_from(result.execution_time.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if result.overrun {
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
        }
        if result.failed_groups > 0 {
            self.failing_cycles.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failing_cycles.store(0, Ordering::Relaxed);
        }
    }

    /// Record an applied configuration reload.
    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the daemon as shutting down.
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Total cycle count.
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    /// Overrun count.
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }

    /// Uptime since daemon start.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Last cycle time.
    pub fn last_cycle_time(&self) -> Option<Duration> {
        match self.last_cycle_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    /// Health derived from the counters and the controller's error mirror.
    pub fn health(&self, io: &IoDiagnostics) -> HealthStatus {
        if self.shutting_down.load(Ordering::Relaxed) {
            return HealthStatus::ShuttingDown;
        }
        let cycles = self.cycle_count();
        if cycles == 0 {
            return HealthStatus::Starting;
        }
        if self.failing_cycles.load(Ordering::Relaxed) >= UNHEALTHY_AFTER_FAILING_CYCLES {
            return HealthStatus::Unhealthy;
        }

        #[allow(clippy::cast_precision_loss)]
        let overrun_rate = self.overrun_count() as f64 / cycles as f64;
        if overrun_rate > 0.01 || !io.last_errors.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Combine the counters with the controller and cycle metrics.
    pub fn snapshot(&self, io: &IoDiagnostics, metrics: &CycleMetrics) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            health: self.health(io),
            cycle_count: self.cycle_count(),
            overrun_count: self.overrun_count(),
            uptime: self.uptime(),
            last_cycle_time: self.last_cycle_time(),
            avg_cycle_time: metrics.mean(),
            max_cycle_time: metrics.max(),
            transactions: io.transactions,
            malfunctions: io.malfunctions,
            failing_points: io.last_errors.len(),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Format a snapshot in Prometheus text exposition format.
pub fn format_prometheus_metrics(snapshot: &DiagnosticsSnapshot, cycle_period: Duration) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP bas_health Controller health (1=healthy, 0=not healthy)");
    let _ = writeln!(out, "# TYPE bas_health gauge");
    let _ = writeln!(
        out,
        "bas_health{{status=\"{}\"}} {}",
        snapshot.health,
        u8::from(snapshot.health == HealthStatus::Healthy)
    );

    metric(
        &mut out,
        "bas_cycles_total",
        "counter",
        "Control cycles executed",
        snapshot.cycle_count,
    );
    metric(
        &mut out,
        "bas_overruns_total",
        "counter",
        "Cycle overruns",
        snapshot.overrun_count,
    );
    metric(
        &mut out,
        "bas_uptime_seconds",
        "gauge",
        "Daemon uptime in seconds",
        format_args!("{:.3}", snapshot.uptime.as_secs_f64()),
    );
    if let Some(last) = snapshot.last_cycle_time {
        metric(
            &mut out,
            "bas_cycle_time_seconds",
            "gauge",
            "Last cycle execution time",
            format_args!("{:.6}", last.as_secs_f64()),
        );
    }
    if let Some(avg) = snapshot.avg_cycle_time {
        metric(
            &mut out,
            "bas_cycle_time_avg_seconds",
            "gauge",
            "Average cycle execution time",
            format_args!("{:.6}", avg.as_secs_f64()),
        );
    }
    if let Some(max) = snapshot.max_cycle_time {
        metric(
            &mut out,
            "bas_cycle_time_max_seconds",
            "gauge",
            "Maximum cycle execution time",
            format_args!("{:.6}", max.as_secs_f64()),
        );
    }
    metric(
        &mut out,
        "bas_cycle_time_target_seconds",
        "gauge",
        "Configured cycle period",
        format_args!("{:.6}", cycle_period.as_secs_f64()),
    );
    metric(
        &mut out,
        "bas_transactions_total",
        "counter",
        "Physical I/O transactions",
        snapshot.transactions,
    );
    metric(
        &mut out,
        "bas_malfunctions_total",
        "counter",
        "Hardware malfunctions logged",
        snapshot.malfunctions,
    );
    metric(
        &mut out,
        "bas_failing_points",
        "gauge",
        "Points whose last update failed",
        snapshot.failing_points,
    );
    metric(
        &mut out,
        "bas_config_reloads_total",
        "counter",
        "Configuration reloads applied",
        snapshot.reloads,
    );

    out
}
