//! Host access futures and mapped payloads.
//!
//! A [`HostFuture`] is a claim on host access to a tensor. Creating one with
//! write access performs the dirty-flag bookkeeping immediately; the expensive
//! part (waiting for device work and mapping memory) happens in
//! [`HostFuture::wait`]. The returned [`Payload`] borrows the future mutably,
//! so the mapping cannot outlive it and a future cannot be dropped while its
//! payload is still in use.

use std::{fmt, marker::PhantomData, ptr::NonNull, sync::Arc};

use coherent_instrumentation::{MetricEvent, ResourceKind, record_metric};
use tracing::trace;

use super::{CoherentTensor, Representation, dtypes::TensorElement};
use crate::{
    CoherentError, Result, access::Access, backend::{Backend, BufferId}
};

enum TensorRef<'t> {
    Shared(&'t CoherentTensor),
    Exclusive(&'t mut CoherentTensor),
}

impl<'t> TensorRef<'t> {
    fn get(&self) -> &CoherentTensor {
        match self {
            TensorRef::Shared(tensor) => tensor,
            TensorRef::Exclusive(tensor) => tensor,
        }
    }

    fn into_shared(self) -> TensorRef<'t> {
        match self {
            TensorRef::Exclusive(tensor) => TensorRef::Shared(tensor),
            shared => shared,
        }
    }
}

fn moved_from() -> CoherentError {
    CoherentError::InvalidState("host future is empty; it was moved from".to_string())
}

/// Pending host access to a tensor, typed by element.
pub struct HostFuture<'t, T: TensorElement> {
    tensor: Option<TensorRef<'t>>,
    access: Access,
    _element: PhantomData<T>,
}

impl<'t, T: TensorElement> HostFuture<'t, T> {
    pub(crate) fn shared(tensor: &'t CoherentTensor) -> Result<Self> {
        tensor.context()?;
        Ok(Self {
            tensor: Some(TensorRef::Shared(tensor)),
            access: Access::READ,
            _element: PhantomData,
        })
    }

    pub(crate) fn exclusive(tensor: &'t mut CoherentTensor, access: Access) -> Result<Self> {
        if access.writes() {
            tensor.synchronize(tensor.host_representation(), access)?;
        } else if access.is_empty() {
            return Err(CoherentError::InvalidState("access request grants nothing".to_string()));
        } else {
            tensor.context()?;
        }
        Ok(Self {
            tensor: Some(TensorRef::Exclusive(tensor)),
            access,
            _element: PhantomData,
        })
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// False once the future has been moved from.
    pub fn is_valid(&self) -> bool {
        self.tensor.is_some()
    }

    /// Move the claim out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        Self {
            tensor: self.tensor.take(),
            access: self.access,
            _element: PhantomData,
        }
    }

    /// Move the claim out of `source` into a future of `access`, which must not
    /// exceed the source's. A writer may always hand over read-only access.
    ///
    /// Dropping write access ends the source's write episode before the move.
    pub fn convert_from<U: TensorElement>(source: &mut HostFuture<'t, U>, access: Access) -> Result<Self> {
        let tensor = source.adopt(access)?;
        Ok(Self {
            tensor: Some(tensor),
            access,
            _element: PhantomData,
        })
    }

    /// Replace this claim with the one held by `source`. The current claim ends
    /// once the new one has been taken.
    ///
    /// On error both futures are left as they were.
    pub fn assign_from<U: TensorElement>(&mut self, source: &mut HostFuture<'t, U>) -> Result<()> {
        let tensor = source.adopt(self.access)?;
        self.finish();
        self.tensor = Some(tensor);
        Ok(())
    }

    /// Wait for outstanding device work and map the tensor for host access.
    pub fn wait(&mut self) -> Result<Payload<'_, T>> {
        let access = self.access;
        let tensor = self.tensor.as_ref().ok_or_else(moved_from)?.get();
        if tensor.dtype() != T::DTYPE {
            return Err(CoherentError::DtypeMismatch {
                expected: tensor.dtype(),
                actual: T::DTYPE,
            });
        }

        let repr = tensor.host_representation();
        tensor.synchronize(repr, access)?;
        let context = tensor.context()?;
        let backend = context.backend().clone();
        tensor.wait_pending(&backend)?;

        let buffer = tensor.buffer_id(repr)?;
        let region = backend.map_buffer(buffer)?;
        let len = tensor.numel();
        if region.len < tensor.nbytes() {
            backend.unmap_buffer(buffer);
            return Err(CoherentError::InvalidState(format!(
                "mapped {} bytes for a {} byte tensor",
                region.len,
                tensor.nbytes()
            )));
        }

        record_metric!(MetricEvent::HostMapped {
            resource: match repr {
                Representation::Staging => ResourceKind::StagingBuffer,
                _ => ResourceKind::Buffer,
            },
            bytes: tensor.nbytes() as u64,
            writable: access.writes(),
        });
        trace!(?repr, %access, len, "host payload mapped");
        Ok(Payload {
            ptr: region.ptr.cast::<T::Scalar>(),
            len,
            access,
            backend,
            buffer,
            _future: PhantomData,
        })
    }

    fn adopt(&mut self, access: Access) -> Result<TensorRef<'t>> {
        if !self.access.permits(access) {
            return Err(CoherentError::AccessViolation {
                requested: access,
                granted: self.access,
            });
        }
        if access.writes() {
            return self.tensor.take().ok_or_else(moved_from);
        }
        if self.access.writes()
            && let Some(tensor) = &self.tensor
        {
            tensor.get().end_host_write();
        }
        self.tensor.take().map(TensorRef::into_shared).ok_or_else(moved_from)
    }

    fn finish(&mut self) {
        if let Some(tensor) = self.tensor.take()
            && self.access.writes()
        {
            tensor.get().end_host_write();
        }
    }
}

impl<T: TensorElement> Drop for HostFuture<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<T: TensorElement> fmt::Debug for HostFuture<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFuture")
            .field("dtype", &T::DTYPE)
            .field("access", &self.access)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Mapped host view of a tensor, valid while the producing future is borrowed.
pub struct Payload<'f, T: TensorElement> {
    ptr: NonNull<T::Scalar>,
    len: usize,
    access: Access,
    backend: Arc<dyn Backend>,
    buffer: BufferId,
    _future: PhantomData<&'f mut [T::Scalar]>,
}

impl<T: TensorElement> Payload<'_, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn as_slice(&self) -> Result<&[T::Scalar]> {
        if !self.access.reads() {
            return Err(CoherentError::AccessViolation {
                requested: Access::READ,
                granted: self.access,
            });
        }
        // SAFETY: the region stays mapped until drop and holds at least `len` elements.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) })
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [T::Scalar]> {
        if !self.access.writes() {
            return Err(CoherentError::AccessViolation {
                requested: Access::WRITE,
                granted: self.access,
            });
        }
        // SAFETY: as above; `&mut self` makes this the only live view.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    pub fn copy_from_slice(&mut self, values: &[T::Scalar]) -> Result<()> {
        let dst = self.as_mut_slice()?;
        if dst.len() != values.len() {
            return Err(CoherentError::InvalidShape(format!(
                "expected {} elements, got {}",
                dst.len(),
                values.len()
            )));
        }
        dst.copy_from_slice(values);
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<T::Scalar>> {
        Ok(self.as_slice()?.to_vec())
    }
}

impl<T: TensorElement> Drop for Payload<'_, T> {
    fn drop(&mut self) {
        self.backend.unmap_buffer(self.buffer);
    }
}

impl<T: TensorElement> fmt::Debug for Payload<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("dtype", &T::DTYPE)
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}
