//! Control-cycle driver.
//!
//! One cycle is:
//! 1. Run every plugin's update pass in registration order (remote I/O is
//!    only queued)
//! 2. Flush the batch onto the buses
//! 3. Hand the flush report back to the plugins
//! 4. Record metrics and wait for the next deadline
//!
//! Everything runs on the calling thread.

use crate::controller::Controller;
use crate::flush::FlushReport;
use bas_common::config::BasConfig;
use bas_common::error::BasResult;
use bas_common::metrics::CycleMetrics;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Logic run once per control cycle.
pub trait Plugin {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Update pass. Reads and writes go through `controller`.
    ///
    /// # Errors
    ///
    /// Errors are logged by the driver and do not stop the cycle.
    fn update(&mut self, controller: &mut Controller) -> BasResult<()>;

    /// Called after the flush with the demultiplexed read results.
    fn on_flush(&mut self, _report: &FlushReport) {}
}

/// Result of a single cycle execution.
#[derive(Debug, Clone)]
pub struct CycleResult {
    /// Time spent in plugins and flush.
    pub execution_time: Duration,
    /// Whether the cycle exceeded its period.
    pub overrun: bool,
    /// Current cycle number.
    pub cycle_count: u64,
    /// Physical transactions issued by the flush.
    pub transactions: usize,
    /// Batch groups that failed in the flush.
    pub failed_groups: usize,
    /// Plugins whose update returned an error.
    pub plugin_errors: usize,
}

/// Cyclic driver owning the controller and the plugins.
pub struct CycleDriver {
    controller: Controller,
    plugins: Vec<Box<dyn Plugin>>,
    cycle_period: Duration,
    next_deadline: Option<Instant>,
    cycle_count: u64,
    metrics: CycleMetrics,
    log_interval: u64,
}

impl CycleDriver {
    /// Create a driver for `controller` timed by `config`.
    #[must_use]
    pub fn new(controller: Controller, config: &BasConfig) -> Self {
        Self {
            controller,
            plugins: Vec::new(),
            cycle_period: config.cycle_time,
            next_deadline: None,
            cycle_count: 0,
            metrics: CycleMetrics::new(config.metrics.histogram_size, config.cycle_time),
            log_interval: config.metrics.log_interval,
        }
    }

    /// Register a plugin; plugins run in registration order.
    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) {
        info!(plugin = plugin.name(), "Plugin registered");
        self.plugins.push(plugin);
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// The controller.
    #[must_use]
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// The controller, e.g. to reconfigure between cycles.
    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Cycle metrics.
    #[must_use]
    pub fn metrics(&self) -> &CycleMetrics {
        &self.metrics
    }

    /// Cycles executed so far.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Cycle period.
    #[must_use]
    pub fn cycle_period(&self) -> Duration {
        self.cycle_period
    }

    /// Change the cycle period, effective from the next deadline.
    pub fn set_cycle_period(&mut self, period: Duration) {
        if period != self.cycle_period {
            info!(
                from_ms = self.cycle_period.as_millis(),
                to_ms = period.as_millis(),
                "Cycle period changed"
            );
            self.cycle_period = period;
        }
    }

    /// Execute one control cycle, then wait for the next deadline.
    ///
    /// # Errors
    ///
    /// Only a phase violation from the flush; plugin errors and transport
    /// failures are logged and counted.
    pub fn run_cycle(&mut self) -> BasResult<CycleResult> {
        let cycle_start = Instant::now();
        let deadline = self
            .next_deadline
            .unwrap_or(cycle_start + self.cycle_period);

        let mut plugin_errors = 0;
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.update(&mut self.controller) {
                plugin_errors += 1;
                warn!(plugin = plugin.name(), error = %e, "Plugin update failed");
            }
        }

        let report = self.controller.flush()?;
        for plugin in &mut self.plugins {
            plugin.on_flush(&report);
        }

        let execution_time = cycle_start.elapsed();
        self.cycle_count += 1;
        self.metrics.record_cycle(execution_time);
        self.metrics
            .record_flush(report.transactions, report.failures.len());

        let overrun = execution_time > self.cycle_period;
        if overrun {
            warn!(
                cycle = self.cycle_count,
                execution_ms = execution_time.as_millis(),
                period_ms = self.cycle_period.as_millis(),
                "Cycle overrun"
            );
        }

        self.wait_until(deadline);
        let next = deadline + self.cycle_period;
        // Skip missed deadlines instead of bursting to catch up
        self.next_deadline = Some(next.max(Instant::now()));

        trace!(
            cycle = self.cycle_count,
            execution_us = execution_time.as_micros(),
            transactions = report.transactions,
            "Cycle complete"
        );
        self.log_status();

        Ok(CycleResult {
            execution_time,
            overrun,
            cycle_count: self.cycle_count,
            transactions: report.transactions,
            failed_groups: report.failures.len(),
            plugin_errors,
        })
    }

    /// Run `cycles` cycles back to back.
    ///
    /// # Errors
    ///
    /// Stops at the first [`Self::run_cycle`] error.
    pub fn run_for(&mut self, cycles: u64) -> BasResult<()> {
        for _ in 0..cycles {
            self.run_cycle()?;
        }
        Ok(())
    }

    fn log_status(&self) {
        if self.log_interval == 0 || self.cycle_count % self.log_interval != 0 {
            return;
        }
        let diagnostics = self.controller.diagnostics();
        info!(
            cycles = self.cycle_count,
            avg_ms = self.metrics.mean().map_or(0, |d| d.as_millis()),
            max_ms = self.metrics.max().map_or(0, |d| d.as_millis()),
            overruns = self.metrics.overrun_count(),
            transactions = diagnostics.transactions,
            failing_points = diagnostics.last_errors.len(),
            "Periodic status"
        );
    }

    fn wait_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else {
            debug!(cycle = self.cycle_count, "Deadline already passed, not sleeping");
        }
    }
}
