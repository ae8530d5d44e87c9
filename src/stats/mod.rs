//! Statistics and metrics exposition

pub mod exporter;
pub mod metrics;

pub use exporter::{install_recorder, MetricsServer};
