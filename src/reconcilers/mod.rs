//! Reconcilers for clone-target claims
//!
//! This module contains the business logic driven by the controllers.
//! Reconcilers are responsible for:
//! - Deriving the clone state of a claim from its annotations and pods
//! - Creating and removing the clone pods
//! - Recording progress on the claim

pub mod clone;

pub use clone::{CloneReconciler, CloneState};
