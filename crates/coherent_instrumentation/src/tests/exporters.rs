use std::{
    sync::mpsc, time::{Duration, SystemTime, UNIX_EPOCH}
};

use crate::prelude::*;

fn sample_event(span: &str) -> EnrichedMetricEvent {
    EnrichedMetricEvent {
        timestamp: Utc::now(),
        span_id: Some(42),
        parent_span_id: Some(24),
        span_name: Some(span.to_string()),
        event: MetricEvent::RepresentationRefreshed {
            conversion: Conversion::BufferToImage,
            bytes: 64,
            duration_us: 3,
        },
    }
}

#[test]
fn jsonl_exporter_writes_serialised_metrics() {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("coherent_metrics_test_{unique}.jsonl"));

    let event = sample_event("jsonl_span");
    {
        let exporter = JsonlExporter::new(&path).expect("jsonl exporter should open file");
        exporter.export(&event);
    }

    let contents = std::fs::read_to_string(&path).expect("jsonl exporter should write file");
    let expected = serde_json::to_string(&event).expect("event should serialise");
    assert_eq!(contents.trim_end_matches('\n'), expected);
    assert!(contents.contains(r#""type":"RepresentationRefreshed""#));
    assert!(contents.contains(r#""conversion":"buffer_to_image""#));

    std::fs::remove_file(&path).expect("temporary jsonl file should be removable");
}

#[test]
fn channel_exporter_clones_events() {
    let (sender, receiver) = mpsc::channel();
    let exporter = ChannelExporter::new(sender);

    let mut event = sample_event("channel");
    exporter.export(&event);
    event.span_name = Some("mutated".to_string());

    let received = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("channel should receive cloned event");
    assert_eq!(received.span_name.as_deref(), Some("channel"));
    assert_eq!(
        received.event,
        MetricEvent::RepresentationRefreshed {
            conversion: Conversion::BufferToImage,
            bytes: 64,
            duration_us: 3,
        }
    );
}

#[test]
fn metric_events_round_trip_through_tagged_json() {
    let event = MetricEvent::PoolReset {
        pool: PoolKind::PerOperation,
        generation: 3,
        reclaimed: 2,
    };
    let json = serde_json::to_string(&event).expect("serialise");
    assert_eq!(json, r#"{"type":"PoolReset","data":{"pool":"per_operation","generation":3,"reclaimed":2}}"#);
    let decoded: MetricEvent = serde_json::from_str(&json).expect("deserialise");
    assert_eq!(decoded, event);
}
