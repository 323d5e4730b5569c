use std::sync::{Arc, mpsc};

use coherent::{Access, CoherentTensor, Context, F32, HostBackend, TensorOptions, TensorStorage};
use coherent_instrumentation::{Conversion, EnrichedMetricEvent, MetricEvent, MetricsLayer, PoolKind, ResourceKind, exporters::ChannelExporter};
use tracing_subscriber::{Registry, layer::SubscriberExt};

fn capture(body: impl FnOnce()) -> Vec<EnrichedMetricEvent> {
    let (sender, receiver) = mpsc::channel();
    let layer = MetricsLayer::new(vec![Box::new(ChannelExporter::new(sender))]);
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::with_default(subscriber, body);
    receiver.try_iter().collect()
}

#[test]
fn refreshes_are_reported_with_their_conversion() {
    let events = capture(|| {
        let context = Context::new(Arc::new(HostBackend::discrete()));
        let mut tensor = CoherentTensor::new(&[1, 4, 2, 2], TensorOptions::default(), TensorStorage::Pooled(&context)).unwrap();
        {
            let mut future = tensor.host_future_mut::<F32>(Access::WRITE).unwrap();
            future.wait().unwrap().as_mut_slice().unwrap().fill(1.0);
        }
        tensor.device_image_handle().unwrap();
        tensor.device_image_handle().unwrap();
    });

    let conversions: Vec<Conversion> = events
        .iter()
        .filter_map(|event| match event.event {
            MetricEvent::RepresentationRefreshed { conversion, bytes, .. } => {
                assert_eq!(bytes, 64);
                Some(conversion)
            }
            _ => None,
        })
        .collect();
    assert_eq!(conversions, vec![Conversion::StagingToBuffer, Conversion::BufferToImage]);

    let refresh = events
        .iter()
        .find(|event| matches!(event.event, MetricEvent::RepresentationRefreshed { .. }))
        .unwrap();
    assert_eq!(refresh.span_name.as_deref(), Some("convert"));

    assert!(events.iter().any(|event| matches!(
        event.event,
        MetricEvent::HostMapped {
            resource: ResourceKind::StagingBuffer,
            writable: true,
            ..
        }
    )));
}

#[test]
fn pool_activity_is_reported() {
    let events = capture(|| {
        let context = Context::new(Arc::new(HostBackend::unified()));
        let tensor = CoherentTensor::new(&[8], TensorOptions::default(), TensorStorage::Pooled(&context)).unwrap();
        tensor.device_buffer_handle().unwrap();
        drop(tensor);
        context.flush();
    });

    assert!(events.iter().any(|event| matches!(
        event.event,
        MetricEvent::PoolAllocation {
            pool: PoolKind::PerOperation,
            resource: ResourceKind::Buffer,
            reused: false,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event.event,
        MetricEvent::PoolReset {
            pool: PoolKind::PerOperation,
            ..
        }
    )));
}
