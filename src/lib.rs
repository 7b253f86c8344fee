//! Zero-feed-in battery dispatch.
//!
//! Samples household net power from a smart meter, combines it with the
//! battery's own telemetry and publishes a bounded, hysteresis-damped power
//! set-point to the battery every cycle.

pub mod config;
pub mod controller;
pub mod domain;
pub mod meter;
pub mod mqtt;
pub mod telemetry;
pub mod utils;
