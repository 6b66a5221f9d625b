//! Prometheus metrics for the PVC clone controller
//!
//! This module exposes metrics for monitoring controller health and clone
//! progress.

mod prometheus;

pub use prometheus::*;
