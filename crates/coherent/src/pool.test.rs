#![cfg(test)]

use super::*;
use crate::backend::host::HostBackend;

fn host() -> Arc<HostBackend> {
    Arc::new(HostBackend::discrete())
}

#[test]
fn released_buffers_are_reused_by_size_and_kind() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::Persistent);

    let first = pool.allocate_buffer(100, MemoryKind::DeviceLocal).unwrap();
    let first_id = first.id;
    assert_eq!(first.bytes, 256);
    drop(first);
    assert_eq!(pool.stats().free_buffers, 1);

    let other_kind = pool.allocate_buffer(100, MemoryKind::HostVisible).unwrap();
    assert_ne!(other_kind.id, first_id);

    let again = pool.allocate_buffer(200, MemoryKind::DeviceLocal).unwrap();
    assert_eq!(again.id, first_id);

    let stats = pool.stats();
    assert_eq!(stats.allocations, 3);
    assert_eq!(stats.reuses, 1);
    assert_eq!(stats.live_buffers, 2);
    assert_eq!(backend.stats().buffers_created, 2);
}

#[test]
fn images_are_keyed_by_extents_and_format() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::Persistent);
    let extents = ImageExtents::new(2, 2, 1);

    let image = pool.allocate_image(extents, ImageFormat::Rgba32Float).unwrap();
    let id = image.id;
    assert_eq!(image.bytes, 4 * 16);
    image.release();

    let half = pool.allocate_image(extents, ImageFormat::Rgba16Float).unwrap();
    assert_ne!(half.id, id);
    let reused = pool.allocate_image(extents, ImageFormat::Rgba32Float).unwrap();
    assert_eq!(reused.id, id);
    assert_eq!(backend.stats().images_created, 2);
}

#[test]
fn reset_invalidates_per_operation_handles() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::PerOperation);
    let live = pool.allocate_buffer(64, MemoryKind::DeviceLocal).unwrap();
    pool.allocate_buffer(64, MemoryKind::DeviceLocal).unwrap().release();
    assert!(live.check_validity().is_ok());

    assert_eq!(pool.reset(), 2);
    assert!(matches!(live.check_validity(), Err(CoherentError::InvalidState(_))));
    assert_eq!(backend.live_buffers(), 0);

    // Releasing a stale handle must not resurrect the destroyed allocation.
    drop(live);
    let stats = pool.stats();
    assert_eq!(stats.free_buffers, 0);
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.reclaimed, 2);
    assert_eq!(pool.generation(), 1);
}

#[test]
fn persistent_pools_ignore_reset() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::Persistent);
    let live = pool.allocate_buffer(64, MemoryKind::DeviceLocal).unwrap();
    assert_eq!(pool.reset(), 0);
    assert!(live.check_validity().is_ok());
    assert_eq!(backend.live_buffers(), 1);
}

#[test]
fn limit_evicts_free_allocations_before_failing() {
    let backend = host();
    let pool = ResourcePool::with_limit(backend.clone(), Reclamation::Persistent, Some(512));

    let a = pool.allocate_buffer(256, MemoryKind::DeviceLocal).unwrap();
    pool.allocate_buffer(256, MemoryKind::HostVisible).unwrap().release();
    // 256 live + 256 free: the free one is evicted to make room.
    let b = pool.allocate_buffer(256, MemoryKind::DeviceLocal).unwrap();
    assert_eq!(backend.stats().buffers_destroyed, 1);

    match pool.allocate_buffer(1, MemoryKind::DeviceLocal) {
        Err(CoherentError::OutOfMemory { requested, available }) => {
            assert_eq!(requested, 256);
            assert_eq!(available, 0);
        }
        other => panic!("expected out of memory, got {other:?}"),
    }
    drop((a, b));
}

#[test]
fn unaddressable_requests_fail_without_allocating() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::PerOperation);
    assert!(matches!(
        pool.allocate_buffer(usize::MAX - 10, MemoryKind::DeviceLocal),
        Err(CoherentError::OutOfMemory { .. })
    ));
    assert!(matches!(
        pool.allocate_buffer(usize::MAX - 1000, MemoryKind::HostVisible),
        Err(CoherentError::OutOfMemory { .. })
    ));
    assert!(matches!(
        pool.allocate_image(ImageExtents::new(usize::MAX, 2, 1), ImageFormat::Rgba32Float),
        Err(CoherentError::InvalidShape(_))
    ));

    let limited = ResourcePool::with_limit(backend.clone(), Reclamation::Persistent, Some(512));
    assert!(matches!(
        limited.allocate_buffer(usize::MAX - 1000, MemoryKind::DeviceLocal),
        Err(CoherentError::OutOfMemory { .. })
    ));
    assert_eq!(pool.stats().bytes_live, 0);
    assert_eq!(backend.stats().buffers_created, 0);
}

#[test]
fn dropping_the_pool_destroys_everything() {
    let backend = host();
    let pool = ResourcePool::new(backend.clone(), Reclamation::Persistent);
    let live = pool.allocate_buffer(8, MemoryKind::DeviceLocal).unwrap();
    pool.allocate_image(ImageExtents::new(1, 1, 1), ImageFormat::Rgba16Float)
        .unwrap()
        .release();

    drop(pool);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_images(), 0);
    assert!(live.check_validity().is_err());
}
