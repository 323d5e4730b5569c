//! Structured logging and metric plumbing for the coherent tensor runtime.

pub mod config;
pub mod event;
pub mod exporters;
pub mod logging;
pub mod macros;
pub mod prelude;
pub mod recorder;

pub use config::{AppConfig, AppConfigError};
pub use event::{Conversion, MetricEvent, PoolKind, ResourceKind};
pub use logging::init_tracing;
pub use recorder::{EnrichedMetricEvent, MetricExporter, MetricsLayer};

#[cfg(test)]
mod tests;
