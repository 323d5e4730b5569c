//! Re-exports for crates that emit or consume metrics.

pub use crate::config::{AppConfig, AppConfigError};
pub use crate::event::{Conversion, MetricEvent, PoolKind, ResourceKind};
pub use crate::exporters::{ChannelExporter, ConsoleExporter, JsonlExporter};
pub use crate::logging::{LoggingError, init_tracing, metric_exporters};
pub use crate::record_metric;
pub use crate::recorder::{EnrichedMetricEvent, METRICS_TARGET, MetricExporter, MetricsLayer};

pub use chrono::{DateTime, Utc};
pub use serde_json;
pub use tracing::{Level, info, info_span, subscriber};
pub use tracing_subscriber::{self, layer::SubscriberExt};
