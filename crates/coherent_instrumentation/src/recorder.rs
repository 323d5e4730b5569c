//! Tracing layer that routes metric events to exporters.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Event, Subscriber, field::{Field, Visit}};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

use crate::event::MetricEvent;

/// Target used by [`record_metric!`](crate::record_metric).
pub const METRICS_TARGET: &str = "metrics";

/// A metric event together with the span it was emitted in.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedMetricEvent {
    pub timestamp: DateTime<Utc>,
    pub span_id: Option<u64>,
    pub parent_span_id: Option<u64>,
    pub span_name: Option<String>,
    pub event: MetricEvent,
}

/// A sink for metric events.
pub trait MetricExporter: Send + Sync {
    fn export(&self, event: &EnrichedMetricEvent);
}

/// `tracing_subscriber` layer that decodes `metrics` events and fans them out.
#[derive(Clone)]
pub struct MetricsLayer {
    exporters: Arc<Vec<Box<dyn MetricExporter>>>,
}

impl MetricsLayer {
    pub fn new(exporters: Vec<Box<dyn MetricExporter>>) -> Self {
        Self {
            exporters: Arc::new(exporters),
        }
    }

    pub fn exporter_count(&self) -> usize {
        self.exporters.len()
    }

    fn dispatch(&self, event: &EnrichedMetricEvent) {
        for exporter in self.exporters.iter() {
            exporter.export(event);
        }
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if event.metadata().target() != METRICS_TARGET {
            return;
        }

        let mut visitor = MetricVisitor::default();
        event.record(&mut visitor);
        let Some(metric_json) = visitor.metric_json else {
            return;
        };

        let metric: MetricEvent = match serde_json::from_str(&metric_json) {
            Ok(metric) => metric,
            Err(error) => {
                tracing::error!(target: "coherent::instrument", ?error, "failed to decode metric event");
                return;
            }
        };

        let span = ctx.lookup_current();
        let enriched = EnrichedMetricEvent {
            timestamp: Utc::now(),
            span_id: span.as_ref().map(|s| s.id().into_u64()),
            parent_span_id: span.as_ref().and_then(|s| s.parent()).map(|p| p.id().into_u64()),
            span_name: span.as_ref().map(|s| s.name().to_string()),
            event: metric,
        };

        self.dispatch(&enriched);
    }
}

#[derive(Default)]
struct MetricVisitor {
    metric_json: Option<String>,
}

impl Visit for MetricVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "metric" {
            self.metric_json = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "metric" {
            self.metric_json = Some(value.to_string());
        }
    }
}
