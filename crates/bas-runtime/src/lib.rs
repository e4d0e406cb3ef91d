//! Dispatch layer of the building-automation I/O controller.
//!
//! This crate provides:
//! - The device register cache ([`cache`])
//! - The per-cycle batch accumulator ([`batch`]) and its flusher ([`flush`])
//! - Analog scaling helpers ([`scaling`])
//! - The controller facade used by drivers and plugins ([`controller`])
//! - The control-cycle driver ([`scheduler`])

pub mod batch;
pub mod cache;
pub mod controller;
pub mod flush;
pub mod scaling;
pub mod scheduler;

pub use batch::{BatchAccumulator, Correlation, WriteValue};
pub use cache::{GroupKey, RegisterCache, RegisterImage};
pub use controller::{Controller, Deferred, IoDiagnostics};
pub use flush::{Completion, FlushReport, GroupFailure, Sample};
pub use scaling::AnalogReading;
pub use scheduler::{CycleDriver, CycleResult, Plugin};
