//! Acceptance tests for the BAS I/O controller.
//!
//! These tests drive the full stack (controller, batch flusher, register
//! cache and transport pool) against the in-memory simulated bus and I/O
//! module:
//! - Address grammar round trips and the disabled sentinel
//! - Coalescing, demultiplexing and polarity
//! - Failure masking and stale marking
//! - Analog scaling and configuration loading

mod acceptance;
