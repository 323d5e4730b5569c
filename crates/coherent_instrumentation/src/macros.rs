//! Emission macro for [`MetricEvent`](crate::MetricEvent)s.

/// Serialise a metric event and emit it on the `metrics` tracing target.
///
/// Nothing is recorded unless a [`MetricsLayer`](crate::MetricsLayer) is installed.
#[macro_export]
macro_rules! record_metric {
    ($event:expr) => {{
        if ::tracing::event_enabled!(target: "metrics", ::tracing::Level::INFO) {
            if let Ok(__metric_json) = $crate::prelude::serde_json::to_string(&$event) {
                ::tracing::event!(
                    target: "metrics",
                    ::tracing::Level::INFO,
                    metric = %__metric_json
                );
            }
        }
    }};
}
