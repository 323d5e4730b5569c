#![cfg(test)]

use super::*;
use crate::tensor::dtypes::Dtype;

fn write_buffer(backend: &HostBackend, buffer: BufferId, bytes: &[u8]) {
    let region = backend.map_buffer(buffer).expect("map");
    // SAFETY: the region is mapped and at least `bytes.len()` long in these tests.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.ptr.as_ptr(), bytes.len()) };
    backend.unmap_buffer(buffer);
}

fn read_buffer(backend: &HostBackend, buffer: BufferId) -> Vec<u8> {
    let region = backend.map_buffer(buffer).expect("map");
    // SAFETY: mapped region of `len` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(region.ptr.as_ptr(), region.len) }.to_vec();
    backend.unmap_buffer(buffer);
    bytes
}

#[test]
fn submissions_execute_in_order_only_when_waited() {
    let backend = HostBackend::discrete();
    let a = backend.create_buffer(4, MemoryKind::HostVisible).unwrap();
    let b = backend.create_buffer(4, MemoryKind::HostVisible).unwrap();

    let fill = backend
        .submit(vec![TransferCommand::FillBuffer { dst: a, bytes: 4, value: 9 }])
        .unwrap();
    let copy = backend
        .submit(vec![TransferCommand::CopyBuffer { src: a, dst: b, bytes: 4 }])
        .unwrap();
    assert_eq!(backend.pending_submissions(), 2);
    assert_eq!(read_buffer(&backend, b), vec![0; 4]);

    backend.wait(copy).unwrap();
    assert_eq!(backend.pending_submissions(), 0);
    assert_eq!(read_buffer(&backend, b), vec![9; 4]);
    backend.wait(fill).expect("earlier submission already complete");

    let stats = backend.stats();
    assert_eq!(stats.fills, 1);
    assert_eq!(stats.copies, 1);
    assert_eq!(stats.submissions, 2);
}

#[test]
fn device_local_buffers_only_map_on_unified_memory() {
    let discrete = HostBackend::discrete();
    let local = discrete.create_buffer(16, MemoryKind::DeviceLocal).unwrap();
    assert!(matches!(discrete.map_buffer(local), Err(CoherentError::NotHostVisible)));

    let unified = HostBackend::unified();
    let local = unified.create_buffer(16, MemoryKind::DeviceLocal).unwrap();
    assert_eq!(unified.map_buffer(local).unwrap().len, 16);
}

#[test]
fn injected_failures_surface_on_wait_and_skip_commands() {
    let backend = HostBackend::discrete();
    let buffer = backend.create_buffer(4, MemoryKind::HostVisible).unwrap();
    backend.fail_next_submissions(1);

    let failed = backend
        .submit(vec![TransferCommand::FillBuffer { dst: buffer, bytes: 4, value: 1 }])
        .unwrap();
    assert!(matches!(backend.wait(failed), Err(CoherentError::ConversionFailure { .. })));
    assert_eq!(read_buffer(&backend, buffer), vec![0; 4]);

    let retried = backend
        .submit(vec![TransferCommand::FillBuffer { dst: buffer, bytes: 4, value: 1 }])
        .unwrap();
    backend.wait(retried).unwrap();
    assert_eq!(read_buffer(&backend, buffer), vec![1; 4]);
    assert_eq!(backend.stats().failed_submissions, 1);
}

#[test]
fn waiting_on_unknown_submission_is_rejected() {
    let backend = HostBackend::discrete();
    assert!(matches!(backend.wait(SubmissionId(42)), Err(CoherentError::InvalidState(_))));
}

#[test]
fn pack_and_unpack_round_trip_through_rgba_texels() {
    let backend = HostBackend::discrete();
    let layout = PackLayout::new(&[5, 1, 2], Dtype::F32).unwrap();
    let values: Vec<f32> = (0..10).map(|v| v as f32).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();

    let src = backend.create_buffer(bytes.len(), MemoryKind::HostVisible).unwrap();
    let dst = backend.create_buffer(bytes.len(), MemoryKind::HostVisible).unwrap();
    let image = backend.create_image(layout.extents(), ImageFormat::Rgba32Float).unwrap();
    write_buffer(&backend, src, &bytes);

    let id = backend
        .submit(vec![
            TransferCommand::PackBufferToImage { src, dst: image, layout },
            TransferCommand::UnpackImageToBuffer { src: image, dst, layout },
        ])
        .unwrap();
    backend.wait(id).unwrap();

    let texels: Vec<f32> = backend
        .image_bytes(image)
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    // Channel 0..4 of pixel (0, 0), then pixel (0, 1), then the zero-padded slice holding channel 4.
    assert_eq!(&texels[..8], &[0.0, 2.0, 4.0, 6.0, 1.0, 3.0, 5.0, 7.0]);
    assert_eq!(&texels[8..], &[8.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0]);
    assert_eq!(read_buffer(&backend, dst), bytes);
}

#[test]
fn destroying_a_mapped_buffer_waits_for_unmap() {
    let backend = HostBackend::unified();
    let buffer = backend.create_buffer(8, MemoryKind::HostVisible).unwrap();
    let _region = backend.map_buffer(buffer).unwrap();

    backend.destroy_buffer(buffer);
    assert_eq!(backend.live_buffers(), 1);
    assert!(backend.map_buffer(buffer).is_err());

    backend.unmap_buffer(buffer);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.stats().buffers_destroyed, 1);
}
