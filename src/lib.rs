//! PVC clone controller
//!
//! Watches PersistentVolumeClaims carrying a clone request and drives the
//! source and target clone pods that copy data from the source claim into
//! the target, recording progress in the target claim's annotations.

pub mod annotations;
pub mod cluster;
pub mod compat;
pub mod config;
pub mod controllers;
pub mod error;
pub mod expectations;
pub mod metrics;
pub mod reconcilers;
pub mod token;

pub use error::{Error, Result};
