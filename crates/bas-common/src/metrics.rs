//! Control-cycle and bus traffic metrics.
//!
//! Cycle durations go into a fixed-size ring buffer so percentiles can be
//! reported without unbounded growth; bus counters accumulate per flush.

use std::time::Duration;

/// Cycle execution and flush metrics.
#[derive(Debug)]
pub struct CycleMetrics {
    /// Ring buffer of cycle durations in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    total_cycles: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
    overrun_count: u64,
    deadline_ns: u64,
    /// Physical transactions issued by flushes.
    transactions: u64,
    /// Batch groups whose transaction failed.
    failed_groups: u64,
}

impl CycleMetrics {
    /// Create a new collector keeping `histogram_size` samples.
    ///
    /// Cycles longer than `cycle_deadline` count as overruns.
    #[must_use]
    pub fn new(histogram_size: usize, cycle_deadline: Duration) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_cycles: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            deadline_ns: u64::try_from(cycle_deadline.as_nanos()).unwrap_or(u64::MAX),
            transactions: 0,
            failed_groups: 0,
        }
    }

    /// Record one completed cycle.
    pub fn record_cycle(&mut self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_cycles += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.saturating_add(ns);

        if ns > self.deadline_ns {
            self.overrun_count += 1;
        }
    }

    /// Record the bus traffic of one flush.
    pub fn record_flush(&mut self, transactions: usize, failed_groups: usize) {
        self.transactions += transactions as u64;
        self.failed_groups += failed_groups as u64;
    }

    /// Total number of cycles recorded.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Number of cycles that exceeded the deadline.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Mean cycle time.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total_cycles > 0).then(|| Duration::from_nanos(self.sum_ns / self.total_cycles))
    }

    /// Longest cycle observed.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total_cycles > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Compute a percentile (0.0 to 100.0) over the retained samples.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let any = self.total_cycles > 0;
        MetricsSnapshot {
            total_cycles: self.total_cycles,
            min_ns: any.then_some(self.min_ns),
            max_ns: any.then_some(self.max_ns),
            mean_ns: any.then(|| self.sum_ns / self.total_cycles),
            overrun_count: self.overrun_count,
            transactions: self.transactions,
            failed_groups: self.failed_groups,
        }
    }
}

/// Immutable snapshot of metrics for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Total cycles executed.
    pub total_cycles: u64,
    /// Minimum cycle time in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum cycle time in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean cycle time in nanoseconds.
    pub mean_ns: Option<u64>,
    /// Number of cycle overruns.
    pub overrun_count: u64,
    /// Physical bus transactions issued.
    pub transactions: u64,
    /// Batch groups that failed.
    pub failed_groups: u64,
}
