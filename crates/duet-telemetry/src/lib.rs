//! # duet-telemetry
//!
//! Tracing subscriber setup, the Prometheus recorder, and the metric names
//! shared by the store and server crates.

#![deny(unsafe_code)]

pub mod logging;
pub mod metrics;

pub use logging::init_subscriber;
pub use metrics::{describe_metrics, install_recorder, render};
