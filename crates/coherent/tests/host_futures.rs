use std::sync::Arc;

use coherent::{
    Access, CoherentError, CoherentTensor, Context, Dtype, F16, F32, HostBackend, RuntimeConfig, TensorOptions, TensorStorage, WritebackPolicy
};
use half::f16;

fn discrete_with(config: RuntimeConfig) -> (Arc<HostBackend>, Context) {
    let backend = Arc::new(HostBackend::discrete());
    (backend.clone(), Context::with_config(backend, config))
}

fn view(context: &Context, sizes: &[usize]) -> CoherentTensor {
    CoherentTensor::new(sizes, TensorOptions::default(), TensorStorage::Pooled(context)).unwrap()
}

fn fill(tensor: &mut CoherentTensor, values: &[f32]) {
    let mut future = tensor.host_future_mut::<F32>(Access::WRITE).unwrap();
    future.wait().unwrap().copy_from_slice(values).unwrap();
}

#[test]
fn moved_from_futures_fail_and_the_destination_works() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[4]);
    fill(&mut tensor, &[1.0, 2.0, 3.0, 4.0]);

    let mut source = tensor.host_future::<F32>().unwrap();
    let mut moved = source.take();
    assert!(!source.is_valid());
    let err = source.wait().unwrap_err();
    assert!(matches!(err, CoherentError::InvalidState(ref msg) if msg.contains("moved from")));

    assert_eq!(moved.wait().unwrap().to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn conversions_may_only_narrow_access() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[2]);

    let mut write = tensor.host_future_mut::<F32>(Access::READ_WRITE).unwrap();
    let mut read = coherent::HostFuture::<F32>::convert_from(&mut write, Access::READ).unwrap();
    assert!(!write.is_valid());
    assert_eq!(read.access(), Access::READ);

    let widened = coherent::HostFuture::<F32>::convert_from(&mut read, Access::WRITE);
    assert!(matches!(
        widened,
        Err(CoherentError::AccessViolation {
            requested: Access::WRITE,
            granted: Access::READ
        })
    ));
    assert!(read.is_valid(), "a rejected conversion leaves the source intact");
}

#[test]
fn write_futures_downgrade_to_read() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[2]);

    {
        let mut write = tensor.host_future_mut::<F32>(Access::WRITE).unwrap();
        write.wait().unwrap().copy_from_slice(&[7.0, 8.0]).unwrap();
        let mut read = coherent::HostFuture::<F32>::convert_from(&mut write, Access::READ).unwrap();
        assert!(!write.is_valid());
        assert_eq!(read.access(), Access::READ);
        assert_eq!(read.wait().unwrap().to_vec().unwrap(), vec![7.0, 8.0]);

        let widened = coherent::HostFuture::<F32>::convert_from(&mut read, Access::READ_WRITE);
        assert!(matches!(widened, Err(CoherentError::AccessViolation { .. })));
    }
    assert!(tensor.dirty_flags().buffer);
    assert!(!tensor.dirty_flags().staging);
}

#[test]
fn assignment_replaces_the_claim() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[2]);
    fill(&mut tensor, &[5.0, 6.0]);

    let mut source = tensor.host_future::<F32>().unwrap();
    let mut target = source.take();
    let mut empty = source.take();
    assert!(!empty.is_valid());
    empty.assign_from(&mut target).unwrap();
    assert!(!target.is_valid());
    assert_eq!(empty.wait().unwrap().to_vec().unwrap(), vec![5.0, 6.0]);
}

#[test]
fn failed_assignment_keeps_the_current_claim() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[2]);
    fill(&mut tensor, &[3.0, 4.0]);

    let mut source = tensor.host_future::<F32>().unwrap();
    let mut kept = source.take();
    let err = kept.assign_from(&mut source).unwrap_err();
    assert!(matches!(err, CoherentError::InvalidState(ref msg) if msg.contains("moved from")));
    assert!(kept.is_valid());
    assert_eq!(kept.wait().unwrap().to_vec().unwrap(), vec![3.0, 4.0]);
}

#[test]
fn payload_access_matches_the_grant() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[3]);
    {
        let mut write_only = tensor.host_future_mut::<F32>(Access::WRITE).unwrap();
        let mut payload = write_only.wait().unwrap();
        assert!(matches!(payload.as_slice(), Err(CoherentError::AccessViolation { .. })));
        payload.as_mut_slice().unwrap().fill(7.0);
    }
    let mut read_only = tensor.host_future::<F32>().unwrap();
    let mut payload = read_only.wait().unwrap();
    assert!(matches!(payload.as_mut_slice(), Err(CoherentError::AccessViolation { .. })));
    assert_eq!(payload.as_slice().unwrap(), &[7.0; 3]);
}

#[test]
fn element_type_must_match_the_tensor() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let tensor = view(&context, &[3]);
    let mut future = tensor.host_future::<F16>().unwrap();
    assert!(matches!(
        future.wait(),
        Err(CoherentError::DtypeMismatch {
            expected: Dtype::F32,
            actual: Dtype::F16
        })
    ));
}

#[test]
fn half_precision_round_trips_through_the_image() {
    let (backend, context) = discrete_with(RuntimeConfig::default());
    let options = TensorOptions::new(Dtype::F16);
    let mut tensor = CoherentTensor::new(&[1, 3, 2, 1], options, TensorStorage::Pooled(&context)).unwrap();
    let values: Vec<f16> = (0..6).map(|v| f16::from_f32(v as f32 * 0.5)).collect();
    {
        let mut future = tensor.host_future_mut::<F16>(Access::WRITE).unwrap();
        future.wait().unwrap().copy_from_slice(&values).unwrap();
    }

    tensor.device_image_handle().unwrap();
    tensor.device_image_handle_mut(Access::WRITE).unwrap();
    let mut future = tensor.host_future::<F16>().unwrap();
    assert_eq!(future.wait().unwrap().to_vec().unwrap(), values);
    assert_eq!(backend.stats().unpacks, 1);
}

#[test]
fn deferred_writeback_uploads_on_next_device_read() {
    let (backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[4]);
    fill(&mut tensor, &[1.0; 4]);
    assert!(tensor.dirty_flags().buffer);
    assert_eq!(backend.stats().copies, 0);

    tensor.device_buffer_handle().unwrap();
    assert_eq!(backend.stats().copies, 1);
}

#[test]
fn eager_writeback_uploads_when_the_write_ends() {
    let (backend, context) = discrete_with(RuntimeConfig::default().with_writeback(WritebackPolicy::Eager));
    let mut tensor = view(&context, &[4]);
    fill(&mut tensor, &[1.0; 4]);
    assert!(!tensor.dirty_flags().buffer);
    assert!(tensor.dirty_flags().image);
    assert_eq!(backend.stats().copies, 1);

    tensor.device_buffer_handle().unwrap();
    assert_eq!(backend.stats().copies, 1);
}

#[test]
fn explicit_flush_uploads_pending_host_writes_once() {
    let (backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[4]);
    fill(&mut tensor, &[2.0; 4]);
    assert!(tensor.flush_host_writes().unwrap());
    assert!(!tensor.flush_host_writes().unwrap());
    assert_eq!(backend.stats().copies, 1);
}

#[test]
fn read_write_futures_see_device_results() {
    let (_backend, context) = discrete_with(RuntimeConfig::default());
    let mut tensor = view(&context, &[1, 2, 1, 1]);
    fill(&mut tensor, &[1.0, 2.0]);
    tensor.device_image_handle().unwrap();
    tensor.device_image_handle_mut(Access::READ_WRITE).unwrap();

    let mut future = tensor.host_future_mut::<F32>(Access::READ_WRITE).unwrap();
    let mut payload = future.wait().unwrap();
    assert_eq!(payload.as_slice().unwrap(), &[1.0, 2.0]);
    payload.as_mut_slice().unwrap()[0] = 9.0;
    drop(payload);
    drop(future);

    assert_eq!(
        tensor.dirty_flags(),
        coherent::DirtyFlags {
            buffer: true,
            image: true,
            staging: false
        }
    );
}
