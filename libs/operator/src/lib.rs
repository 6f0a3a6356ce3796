#[macro_use]
pub mod controller;
pub mod error;
pub mod metrics;
pub mod prometheus_exporter;
pub mod telemetry;
