use std::{sync::mpsc, time::Duration};

use crate::prelude::*;

fn channel_subscriber() -> (impl tracing::Subscriber + Send + Sync, mpsc::Receiver<EnrichedMetricEvent>) {
    let (sender, receiver) = mpsc::channel();
    let exporters: Vec<Box<dyn MetricExporter>> = vec![Box::new(ChannelExporter::new(sender))];
    (tracing_subscriber::registry().with(MetricsLayer::new(exporters)), receiver)
}

#[test]
fn metrics_layer_enriches_span_context() {
    let (subscriber, receiver) = channel_subscriber();
    let metric = MetricEvent::PoolAllocation {
        pool: PoolKind::Persistent,
        resource: ResourceKind::Image,
        bytes: 4096,
        reused: true,
    };

    let (parent_id, child_id) = subscriber::with_default(subscriber, || {
        let parent = info_span!("tensor_access");
        let parent_id = parent.id().map(|id| id.into_u64());
        let _parent_guard = parent.enter();

        let child = info_span!("image_refresh");
        let child_id = child.id().map(|id| id.into_u64());
        let _child_guard = child.enter();

        record_metric!(metric.clone());
        (parent_id, child_id)
    });

    let enriched = receiver.recv_timeout(Duration::from_secs(1)).expect("metric should be dispatched");
    assert_eq!(enriched.span_id, child_id);
    assert_eq!(enriched.parent_span_id, parent_id);
    assert_eq!(enriched.span_name.as_deref(), Some("image_refresh"));
    assert_eq!(enriched.event, metric);
}

#[test]
fn metrics_layer_ignores_non_metric_events() {
    let (subscriber, receiver) = channel_subscriber();
    subscriber::with_default(subscriber, || {
        let span = info_span!("non_metric_span");
        let _guard = span.enter();
        info!("non-metric event should be ignored");
        tracing::info!(target: "metrics", metric = "not json");
    });
    assert!(receiver.try_recv().is_err(), "channel should remain empty");
}

#[test]
fn record_metric_is_silent_without_a_layer() {
    let subscriber = tracing_subscriber::registry();
    subscriber::with_default(subscriber, || {
        record_metric!(MetricEvent::HostWriteback { bytes: 16, eager: true });
    });
}
