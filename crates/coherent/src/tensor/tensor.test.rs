#![cfg(test)]

use std::sync::Arc;

use super::*;
use crate::{
    backend::{TransferCommand, host::HostBackend}, config::RuntimeConfig, tensor::dtypes::F32
};

fn discrete() -> (Arc<HostBackend>, Context) {
    let backend = Arc::new(HostBackend::discrete());
    (backend.clone(), Context::new(backend))
}

fn unified() -> (Arc<HostBackend>, Context) {
    let backend = Arc::new(HostBackend::unified());
    (backend.clone(), Context::new(backend))
}

fn new_view(context: &Context, sizes: &[usize]) -> CoherentTensor {
    CoherentTensor::new(sizes, TensorOptions::default(), TensorStorage::Pooled(context)).unwrap()
}

fn write_host(tensor: &mut CoherentTensor, values: &[f32]) {
    let mut future = tensor.host_future_mut::<F32>(Access::WRITE).unwrap();
    let mut payload = future.wait().unwrap();
    payload.copy_from_slice(values).unwrap();
}

fn read_host(tensor: &CoherentTensor) -> Vec<f32> {
    let mut future = tensor.host_future::<F32>().unwrap();
    let payload = future.wait().unwrap();
    payload.to_vec().unwrap()
}

#[test]
fn new_tensors_allocate_nothing_and_start_clean() {
    let (backend, context) = discrete();
    let tensor = new_view(&context, &[2, 3]);
    assert_eq!(tensor.dirty_flags(), DirtyFlags::default());
    for repr in Representation::ALL {
        assert!(!tensor.is_allocated(repr));
    }
    assert_eq!(tensor.numel(), 6);
    assert_eq!(tensor.nbytes(), 24);
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn host_round_trip_on_discrete_memory_stays_in_staging() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[4]);
    assert!(tensor.uses_staging());

    write_host(&mut tensor, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(
        tensor.dirty_flags(),
        DirtyFlags {
            buffer: true,
            image: true,
            staging: false
        }
    );
    assert_eq!(read_host(&tensor), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(backend.stats().transfers(), 0);
    assert!(!tensor.is_allocated(Representation::Buffer));
}

#[test]
fn host_writes_reach_the_device_buffer() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[4]);
    write_host(&mut tensor, &[1.0, 2.0, 3.0, 4.0]);
    let buffer = tensor.device_buffer_handle().unwrap().id();

    let readback = backend.create_buffer(16, MemoryKind::HostVisible).unwrap();
    let copy = backend
        .submit(vec![TransferCommand::CopyBuffer {
            src: buffer,
            dst: readback,
            bytes: 16,
        }])
        .unwrap();
    backend.wait(copy).unwrap();
    let region = backend.map_buffer(readback).unwrap();
    // SAFETY: the readback is mapped and holds 16 bytes.
    let values = unsafe { std::slice::from_raw_parts(region.ptr.as_ptr().cast::<f32>(), 4) }.to_vec();
    backend.unmap_buffer(readback);
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn host_round_trip_on_unified_memory_uses_the_buffer() {
    let (backend, context) = unified();
    let mut tensor = new_view(&context, &[1, 2, 2]);
    assert!(!tensor.uses_staging());
    assert_eq!(tensor.host_representation(), Representation::Buffer);

    write_host(&mut tensor, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(read_host(&tensor), vec![1.0, 2.0, 3.0, 4.0]);

    let buffer = tensor.device_buffer_handle().unwrap();
    assert_eq!(buffer.memory_kind(), MemoryKind::HostVisible);
    assert_eq!(backend.stats().transfers(), 0);
    assert!(!tensor.is_allocated(Representation::Staging));
}

#[test]
fn forced_staging_applies_on_unified_memory() {
    let backend = Arc::new(HostBackend::unified());
    let context = Context::with_config(backend, RuntimeConfig::default().with_force_staging(true));
    let tensor = new_view(&context, &[4]);
    assert!(tensor.uses_staging());
    assert_eq!(tensor.host_representation(), Representation::Staging);
}

#[test]
fn device_reads_refresh_once_from_host_writes() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[1, 4, 1, 1]);
    write_host(&mut tensor, &[1.0, 2.0, 3.0, 4.0]);

    let buffer = tensor.device_buffer_handle().unwrap().id();
    assert_eq!(tensor.device_buffer_handle().unwrap().id(), buffer);
    assert_eq!(backend.stats().copies, 1);

    let image = tensor.device_image_handle().unwrap().id();
    tensor.device_image_handle().unwrap();
    let stats = backend.stats();
    assert_eq!(stats.packs, 1);
    assert_eq!(stats.copies, 1);
    assert_eq!(tensor.dirty_flags(), DirtyFlags::default());

    let texels = backend.image_bytes(image).unwrap();
    let lanes: Vec<f32> = texels
        .chunks_exact(4)
        .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect();
    assert_eq!(lanes, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn buffer_write_then_image_read_packs_without_staging() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[3, 5]);
    tensor.device_buffer_handle_mut(Access::WRITE).unwrap();
    assert_eq!(
        tensor.dirty_flags(),
        DirtyFlags {
            buffer: false,
            image: true,
            staging: true
        }
    );

    tensor.device_image_handle().unwrap();
    let stats = backend.stats();
    assert_eq!(stats.packs, 1);
    assert_eq!(stats.copies, 0);
    assert!(!tensor.is_allocated(Representation::Staging));
}

#[test]
fn image_writes_flow_back_to_the_host() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[1, 5, 1, 2]);
    let values: Vec<f32> = (0..10).map(|v| v as f32).collect();
    write_host(&mut tensor, &values);
    tensor.device_image_handle().unwrap();

    // An in-place image kernel leaves the image as the only clean copy.
    tensor.device_image_handle_mut(Access::READ_WRITE).unwrap();
    assert_eq!(
        tensor.dirty_flags(),
        DirtyFlags {
            buffer: true,
            image: false,
            staging: true
        }
    );

    assert_eq!(read_host(&tensor), values);
    let stats = backend.stats();
    assert_eq!(stats.unpacks, 1);
    assert_eq!(stats.copies, 2);
    assert_eq!(tensor.dirty_flags(), DirtyFlags::default());
}

#[test]
fn every_access_keeps_one_representation_clean() {
    let (_backend, context) = discrete();
    let mut tensor = new_view(&context, &[2, 2]);
    write_host(&mut tensor, &[0.0; 4]);

    let steps = [
        (Representation::Image, Access::READ),
        (Representation::Buffer, Access::WRITE),
        (Representation::Staging, Access::READ),
        (Representation::Image, Access::READ_WRITE),
        (Representation::Buffer, Access::READ),
        (Representation::Staging, Access::WRITE),
        (Representation::Image, Access::READ),
    ];
    for (repr, access) in steps {
        tensor.synchronize(repr, access).unwrap();
        let flags = tensor.dirty_flags();
        assert!(flags.count() <= 2, "{repr:?} {access}: {flags:?}");
        if access.writes() {
            assert_eq!(flags.count(), 2);
            assert!(!flags.get(repr));
        } else {
            assert!(!flags.get(repr));
        }
    }
}

#[test]
fn empty_access_is_rejected() {
    let (_backend, context) = discrete();
    let mut tensor = new_view(&context, &[4]);
    assert!(matches!(
        tensor.device_buffer_handle_mut(Access::NONE),
        Err(CoherentError::InvalidState(_))
    ));
}

#[test]
fn failed_conversions_keep_the_target_dirty() {
    let (backend, context) = discrete();
    let mut tensor = new_view(&context, &[8]);
    write_host(&mut tensor, &[1.0; 8]);

    backend.fail_next_submissions(1);
    let err = tensor.device_buffer_handle().unwrap_err();
    assert!(matches!(err, CoherentError::ConversionFailure { conversion: "staging->buffer", .. }));
    assert!(tensor.dirty_flags().buffer);

    tensor.device_buffer_handle().unwrap();
    assert!(!tensor.dirty_flags().buffer);
    assert_eq!(backend.stats().failed_submissions, 1);
}

#[test]
fn options_and_shapes_are_validated() {
    let (_backend, context) = discrete();
    let bytes = CoherentTensor::new(&[4], TensorOptions::new(Dtype::U8), TensorStorage::Pooled(&context));
    assert!(matches!(bytes, Err(CoherentError::UnsupportedOptions { dtype: Dtype::U8, .. })));

    let channels_last = TensorOptions::default().with_layout(crate::options::MemoryLayout::ChannelsLast);
    assert!(matches!(
        CoherentTensor::new(&[4], channels_last, TensorStorage::Pooled(&context)),
        Err(CoherentError::UnsupportedOptions { .. })
    ));
    assert!(matches!(
        CoherentTensor::new(&[1, 2, 3, 4, 5], TensorOptions::default(), TensorStorage::Pooled(&context)),
        Err(CoherentError::InvalidShape(_))
    ));
    assert!(matches!(
        CoherentTensor::new(&[usize::MAX, 2], TensorOptions::default(), TensorStorage::Pooled(&context)),
        Err(CoherentError::InvalidShape(_))
    ));
}

#[test]
fn lost_or_dropped_contexts_fail_access() {
    let (_backend, context) = discrete();
    let tensor = new_view(&context, &[4]);
    context.mark_lost();
    assert!(matches!(tensor.device_buffer_handle(), Err(CoherentError::InvalidContext(_))));
    assert!(matches!(
        CoherentTensor::new(&[4], TensorOptions::default(), TensorStorage::Pooled(&context)),
        Err(CoherentError::InvalidContext(_))
    ));

    let (_backend, context) = discrete();
    let tensor = new_view(&context, &[4]);
    drop(context);
    assert!(matches!(tensor.host_future::<F32>(), Err(CoherentError::InvalidContext(_))));
}

#[test]
fn flushed_allocations_are_not_silently_reused() {
    let (_backend, context) = discrete();
    let tensor = new_view(&context, &[4]);
    tensor.device_buffer_handle().unwrap();
    context.flush();
    assert!(matches!(tensor.device_buffer_handle(), Err(CoherentError::InvalidState(_))));
}

#[test]
fn tracked_device_writes_complete_before_host_reads() {
    let (backend, context) = unified();
    let mut tensor = new_view(&context, &[4]);
    {
        let lease = tensor.device_buffer_handle_mut(Access::WRITE).unwrap();
        let submission = backend
            .submit(vec![TransferCommand::FillBuffer {
                dst: lease.id(),
                bytes: 16,
                value: 0x3f,
            }])
            .unwrap();
        lease.track_submission(submission).unwrap();
    }
    assert_eq!(backend.pending_submissions(), 1);

    let expected = f32::from_bits(0x3f3f_3f3f);
    assert_eq!(read_host(&tensor), vec![expected; 4]);
    assert_eq!(backend.pending_submissions(), 0);
}

#[test]
fn read_leases_cannot_track_writes() {
    let (backend, context) = unified();
    let tensor = new_view(&context, &[4]);
    let lease = tensor.device_buffer_handle().unwrap();
    let submission = backend.submit(Vec::new()).unwrap();
    assert!(matches!(
        lease.track_submission(submission),
        Err(CoherentError::AccessViolation { .. })
    ));
}
