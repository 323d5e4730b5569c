use coherent_instrumentation::{AppConfig, MetricEvent, init_tracing, record_metric};

#[test]
fn init_tracing_installs_once() {
    let config = AppConfig::default();
    assert!(init_tracing(&config).unwrap());
    assert!(!init_tracing(&config).unwrap());

    // Without exporters the metric is dropped by the fmt layer's target filter.
    record_metric!(MetricEvent::HostWriteback { bytes: 4, eager: false });
    tracing::info!("subscriber installed");
}
