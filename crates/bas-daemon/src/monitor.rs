//! Built-in plugin that watches the configured `monitor.points`.
//!
//! Every cycle it queues a read of each point; after the flush it logs the
//! points whose value changed. Points the controller rejects (bad address,
//! unknown pin) are reported once and skipped until the point list changes.

use bas_common::error::BasResult;
use bas_fieldbus::Endpoint;
use bas_runtime::{AnalogReading, Controller, Deferred, FlushReport, Plugin};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Analog changes smaller than this are not reported.
const ANALOG_DEADBAND: f64 = 1e-6;

/// Last value seen for a monitored point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observed {
    /// Boolean point.
    Digital(bool),
    /// Analog point in engineering units.
    Analog(f64),
}

impl Observed {
    fn differs(self, other: Self) -> bool {
        match (self, other) {
            (Self::Analog(a), Self::Analog(b)) => (a - b).abs() > ANALOG_DEADBAND,
            (a, b) => a != b,
        }
    }
}

impl std::fmt::Display for Observed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Digital(v) => write!(f, "{v}"),
            Self::Analog(v) => write!(f, "{v:.3}"),
        }
    }
}

#[derive(Debug)]
enum PendingRead {
    Digital(Deferred<bool>),
    Analog(Deferred<AnalogReading>),
}

impl PendingRead {
    fn resolve(&self, report: &FlushReport) -> (Observed, bool) {
        match self {
            Self::Digital(read) => (Observed::Digital(read.resolve(report)), read.is_stale(report)),
            Self::Analog(read) => (
                Observed::Analog(read.resolve(report).value),
                read.is_stale(report),
            ),
        }
    }
}

/// Logs value changes of the configured monitor points.
#[derive(Debug, Default)]
pub struct MonitorPlugin {
    points: Vec<String>,
    rejected: BTreeSet<String>,
    pending: Vec<(String, PendingRead)>,
    last: BTreeMap<String, Observed>,
    changes: u64,
}

impl MonitorPlugin {
    /// Create an idle monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last observed value of every monitored point.
    #[cfg(test)]
    pub fn last_values(&self) -> &BTreeMap<String, Observed> {
        &self.last
    }

    /// Changes logged so far, first observations included.
    #[cfg(test)]
    pub fn change_count(&self) -> u64 {
        self.changes
    }

    /// Points skipped because the controller rejected them.
    #[cfg(test)]
    pub fn rejected(&self) -> &BTreeSet<String> {
        &self.rejected
    }

    fn sync_points(&mut self, points: &[String]) {
        if self.points != points {
            debug!(count = points.len(), "Monitor point list changed");
            self.points = points.to_vec();
            self.rejected.clear();
            self.last.retain(|name, _| points.contains(name));
        }
    }

    fn queue(controller: &mut Controller, name: &str) -> BasResult<PendingRead> {
        let analog = Endpoint::parse(name)?
            .kind()
            .is_some_and(|kind| kind.is_analog());
        if analog {
            controller.analog_read_deferred(name).map(PendingRead::Analog)
        } else {
            controller.digital_read_deferred(name).map(PendingRead::Digital)
        }
    }
}

impl Plugin for MonitorPlugin {
    fn name(&self) -> &str {
        "monitor"
    }

    fn update(&mut self, controller: &mut Controller) -> BasResult<()> {
        let points = controller.config().monitor.points.clone();
        self.sync_points(&points);
        self.pending.clear();

        for name in points {
            if self.rejected.contains(&name) {
                continue;
            }
            match Self::queue(controller, &name) {
                Ok(read) => self.pending.push((name, read)),
                Err(e) => {
                    warn!(point = %name, error = %e, "Monitor point rejected");
                    self.rejected.insert(name);
                }
            }
        }
        Ok(())
    }

    fn on_flush(&mut self, report: &FlushReport) {
        for (name, read) in self.pending.drain(..) {
            let (value, stale) = read.resolve(report);
            if stale {
                continue;
            }
            let previous = self.last.insert(name.clone(), value);
            match previous {
                Some(old) if !old.differs(value) => {}
                Some(old) => {
                    self.changes += 1;
                    info!(point = %name, from = %old, to = %value, "Point changed");
                }
                None => {
                    self.changes += 1;
                    info!(point = %name, value = %value, "Point observed");
                }
            }
        }
    }
}
