//! Acceptance test modules.

mod common;
mod config_test;
mod dispatch_test;
mod scaling_test;
