use std::sync::Arc;

use coherent::{
    Access, CoherentError, CoherentTensor, Context, F32, HostBackend, ImageExtents, MemoryKind, PersistentPool, Representation, RuntimeConfig, TensorOptions, TensorStorage
};
use serial_test::serial;

fn discrete() -> (Arc<HostBackend>, Context) {
    let backend = Arc::new(HostBackend::discrete());
    (backend.clone(), Context::new(backend))
}

#[test]
fn persistent_tensors_survive_a_context_flush() {
    let (_backend, context) = discrete();
    let pool = PersistentPool::new(&context).unwrap();
    let mut weights = CoherentTensor::new(&[4], TensorOptions::default(), TensorStorage::Persistent(&pool)).unwrap();
    let scratch = CoherentTensor::new(&[4], TensorOptions::default(), TensorStorage::Pooled(&context)).unwrap();
    assert!(weights.is_persistent());
    assert!(!scratch.is_persistent());

    {
        let mut future = weights.host_future_mut::<F32>(Access::WRITE).unwrap();
        future.wait().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    }
    weights.device_buffer_handle().unwrap();
    scratch.device_buffer_handle().unwrap();

    context.flush();

    assert!(weights.device_image_handle().is_ok());
    assert!(matches!(scratch.device_buffer_handle(), Err(CoherentError::InvalidState(_))));
    let mut future = weights.host_future::<F32>().unwrap();
    assert_eq!(future.wait().unwrap().to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn released_persistent_allocations_are_reused() {
    let (backend, context) = discrete();
    let pool = PersistentPool::new(&context).unwrap();
    let options = TensorOptions::default();

    let buffer = pool.buffer(&[64], &options).unwrap();
    assert_eq!(buffer.kind, MemoryKind::DeviceLocal);
    let id = buffer.id;
    drop(buffer);
    assert_eq!(pool.buffer(&[32], &options).unwrap().id, id);

    let staging = pool.staging(&[64], &options).unwrap();
    assert_eq!(staging.kind, MemoryKind::HostVisible);

    let extents = ImageExtents::new(2, 2, 1);
    let image = pool.image(extents, &options).unwrap();
    assert_eq!(image.extents, extents);

    assert_eq!(backend.stats().buffers_created, 2);
    assert_eq!(pool.resource_pool().stats().reuses, 1);
}

#[test]
fn unified_persistent_buffers_are_host_visible() {
    let context = Context::new(Arc::new(HostBackend::unified()));
    let pool = PersistentPool::new(&context).unwrap();
    let buffer = pool.buffer(&[8], &TensorOptions::default()).unwrap();
    assert_eq!(buffer.kind, MemoryKind::HostVisible);
}

#[test]
fn persistent_pools_require_a_live_context() {
    let (_backend, context) = discrete();
    let weak = context.downgrade();
    let pool = PersistentPool::new(&context).unwrap();
    context.mark_lost();
    assert!(matches!(PersistentPool::from_ref(&weak), Err(CoherentError::InvalidContext(_))));
    assert!(matches!(
        pool.buffer(&[4], &TensorOptions::default()),
        Err(CoherentError::InvalidContext(_))
    ));
}

#[test]
fn oversized_persistent_requests_are_rejected() {
    let (backend, context) = discrete();
    let pool = PersistentPool::new(&context).unwrap();
    let options = TensorOptions::default();
    assert!(matches!(pool.buffer(&[usize::MAX, 2], &options), Err(CoherentError::InvalidShape(_))));
    assert!(matches!(pool.staging(&[usize::MAX / 2, 3], &options), Err(CoherentError::InvalidShape(_))));
    assert!(matches!(
        pool.image(ImageExtents::new(usize::MAX, 1, 2), &options),
        Err(CoherentError::InvalidShape(_))
    ));
    assert_eq!(pool.resource_pool().stats().bytes_live, 0);
    assert_eq!(backend.stats().buffers_created, 0);
    assert_eq!(backend.stats().images_created, 0);
}

#[test]
fn persistent_limit_comes_from_the_context_config() {
    let backend = Arc::new(HostBackend::discrete());
    let config = RuntimeConfig {
        persistent_pool_max_bytes: Some(512),
        ..RuntimeConfig::default()
    };
    let context = Context::with_config(backend, config);
    let pool = PersistentPool::new(&context).unwrap();
    let _first = pool.buffer(&[64], &TensorOptions::default()).unwrap();
    let _second = pool.buffer(&[64], &TensorOptions::default()).unwrap();
    assert!(matches!(
        pool.buffer(&[64], &TensorOptions::default()),
        Err(CoherentError::OutOfMemory { .. })
    ));
}

#[test]
#[serial]
fn process_wide_pool_is_shared() {
    let _backend = coherent_env::EnvVarGuard::set(coherent_env::RuntimeEnvVar::Backend, "host");
    let first = {
        let pool = coherent::persistent().unwrap();
        let context = pool.context().unwrap();
        assert_eq!(context.backend().name(), "host");
        context.id()
    };
    let pool = coherent::persistent().unwrap();
    assert_eq!(pool.context().unwrap().id(), first);

    let tensor = CoherentTensor::new(&[2], TensorOptions::default(), TensorStorage::Persistent(&pool)).unwrap();
    tensor.device_buffer_handle().unwrap();
    assert!(tensor.is_allocated(Representation::Buffer));
}

#[test]
#[serial]
fn concurrent_first_use_builds_one_pool() {
    let _backend = coherent_env::EnvVarGuard::set(coherent_env::RuntimeEnvVar::Backend, "host");
    let ids: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| coherent::persistent().unwrap().context().unwrap().id()))
            .collect();
        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    });
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
}
