//! The coherent tensor view.
//!
//! A [`CoherentTensor`] owns up to three physical copies of the same bytes:
//! a device buffer, a device image (RGBA texels, see [`PackLayout`]) and, on
//! discrete memory, a host-visible staging buffer. Each has a dirty flag.
//! Accessors refresh a stale representation from a clean one before reading
//! it and invalidate the other two when writing it, so at least one
//! representation is always authoritative once the tensor has been written.
//!
//! The view is single-threaded: flags and lazily created allocations live in
//! `Cell`/`RefCell`, so the read-only accessors can refresh caches through
//! `&self`.

use std::{
    cell::{Cell, RefCell}, fmt, sync::Arc
};

use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::{
    Result, access::Access, backend::{Backend, BufferId, ImageExtents, ImageFormat, ImageId, MemoryKind, PackLayout, SubmissionId}, config::WritebackPolicy, context::{Context, ContextRef}, error::CoherentError, handle::Handle, options::{self, TensorOptions}, persistent::PersistentPool, pool::{BufferResource, ImageResource, Reclamation, ResourcePool}
};

pub mod dtypes;
pub mod future;
mod sync;

use dtypes::{Dtype, TensorElement};
use future::HostFuture;

/// One of the three physical encodings of a tensor's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    Buffer,
    Image,
    Staging,
}

impl Representation {
    pub const ALL: [Representation; 3] = [Representation::Buffer, Representation::Image, Representation::Staging];
}

/// Per-representation staleness. `true` means the bytes are out of date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    pub buffer: bool,
    pub image: bool,
    pub staging: bool,
}

impl DirtyFlags {
    pub const fn get(&self, repr: Representation) -> bool {
        match repr {
            Representation::Buffer => self.buffer,
            Representation::Image => self.image,
            Representation::Staging => self.staging,
        }
    }

    fn set(&mut self, repr: Representation, dirty: bool) {
        match repr {
            Representation::Buffer => self.buffer = dirty,
            Representation::Image => self.image = dirty,
            Representation::Staging => self.staging = dirty,
        }
    }

    /// `repr` was written: it becomes the only clean representation.
    fn mark_written(&mut self, repr: Representation) {
        for other in Representation::ALL {
            self.set(other, other != repr);
        }
    }

    pub fn count(&self) -> usize {
        Representation::ALL.iter().filter(|repr| self.get(**repr)).count()
    }
}

/// Where a tensor's allocations come from.
pub enum TensorStorage<'a> {
    /// The context's per-operation pool; reclaimed by [`Context::flush`].
    Pooled(&'a Context),
    /// A persistent pool; survives flushes.
    Persistent(&'a PersistentPool),
}

pub struct CoherentTensor {
    context: ContextRef,
    pool: ResourcePool,
    sizes: SmallVec<[usize; 4]>,
    options: TensorOptions,
    layout: PackLayout,
    uses_staging: bool,
    writeback: WritebackPolicy,
    buffer: RefCell<Option<Handle<BufferResource>>>,
    image: RefCell<Option<Handle<ImageResource>>>,
    staging: RefCell<Option<Handle<BufferResource>>>,
    dirty: Cell<DirtyFlags>,
    pending: Cell<Option<SubmissionId>>,
}

impl CoherentTensor {
    /// Create an uninitialised view. Nothing is allocated until first access.
    pub fn new(sizes: &[usize], options: TensorOptions, storage: TensorStorage<'_>) -> Result<Self> {
        options::verify(&options)?;
        let layout = PackLayout::new(sizes, options.dtype)?;
        let (context, pool) = match storage {
            TensorStorage::Pooled(context) => {
                context.ensure_valid()?;
                (context.clone(), context.pool().clone())
            }
            TensorStorage::Persistent(pool) => (pool.context()?, pool.resource_pool().clone()),
        };
        let config = context.config();
        let uses_staging = !context.unified_memory() || config.force_staging;

        trace!(?sizes, dtype = ?options.dtype, uses_staging, reclamation = ?pool.reclamation(), "tensor view created");
        Ok(Self {
            context: context.downgrade(),
            pool,
            sizes: SmallVec::from_slice(sizes),
            options,
            layout,
            uses_staging,
            writeback: config.writeback,
            buffer: RefCell::new(None),
            image: RefCell::new(None),
            staging: RefCell::new(None),
            dirty: Cell::new(DirtyFlags::default()),
            pending: Cell::new(None),
        })
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn options(&self) -> &TensorOptions {
        &self.options
    }

    pub fn dtype(&self) -> Dtype {
        self.options.dtype
    }

    pub fn numel(&self) -> usize {
        self.layout.elements()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.options.dtype.size_bytes()
    }

    pub fn pack_layout(&self) -> &PackLayout {
        &self.layout
    }

    pub fn image_extents(&self) -> ImageExtents {
        self.layout.extents()
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.dirty.get()
    }

    /// Whether host access goes through a separate staging buffer.
    pub fn uses_staging(&self) -> bool {
        self.uses_staging
    }

    pub fn is_persistent(&self) -> bool {
        self.pool.reclamation() == Reclamation::Persistent
    }

    pub fn writeback_policy(&self) -> WritebackPolicy {
        self.writeback
    }

    pub fn context(&self) -> Result<Context> {
        self.context.upgrade()
    }

    pub fn is_allocated(&self, repr: Representation) -> bool {
        match repr {
            Representation::Buffer => self.buffer.borrow().is_some(),
            Representation::Image => self.image.borrow().is_some(),
            Representation::Staging => self.staging.borrow().is_some(),
        }
    }

    /// The representation backing host access.
    pub fn host_representation(&self) -> Representation {
        if self.uses_staging {
            Representation::Staging
        } else {
            Representation::Buffer
        }
    }

    /// The device buffer, refreshed for reading.
    pub fn device_buffer_handle(&self) -> Result<DeviceBuffer<'_>> {
        self.buffer_lease(Access::READ)
    }

    /// The device buffer under `access`. Write access invalidates the image and staging copies.
    pub fn device_buffer_handle_mut(&mut self, access: Access) -> Result<DeviceBuffer<'_>> {
        self.buffer_lease(access)
    }

    /// The device image, packed from the buffer if it is stale.
    pub fn device_image_handle(&self) -> Result<DeviceImage<'_>> {
        self.image_lease(Access::READ)
    }

    pub fn device_image_handle_mut(&mut self, access: Access) -> Result<DeviceImage<'_>> {
        self.image_lease(access)
    }

    /// A read-only host access future.
    pub fn host_future<T: TensorElement>(&self) -> Result<HostFuture<'_, T>> {
        HostFuture::shared(self)
    }

    /// A host access future under `access`.
    ///
    /// Write bookkeeping happens here, before the future is returned; the
    /// mapping itself is deferred to [`HostFuture::wait`].
    pub fn host_future_mut<T: TensorElement>(&mut self, access: Access) -> Result<HostFuture<'_, T>> {
        HostFuture::exclusive(self, access)
    }

    /// Record device work that writes this tensor; host access waits for it before mapping.
    pub fn track_submission(&mut self, submission: SubmissionId) {
        self.pending.set(Some(submission));
    }

    /// Upload pending host writes from staging to the device buffer now.
    ///
    /// Returns whether an upload was needed.
    pub fn flush_host_writes(&mut self) -> Result<bool> {
        self.writeback_staging(false)
    }

    fn buffer_lease(&self, access: Access) -> Result<DeviceBuffer<'_>> {
        self.synchronize(Representation::Buffer, access)?;
        let (id, bytes, kind) = {
            let slot = self.buffer.borrow();
            let handle = slot.as_ref().ok_or_else(|| unallocated(Representation::Buffer))?;
            (handle.id, handle.bytes, handle.kind)
        };
        Ok(DeviceBuffer {
            tensor: self,
            id,
            bytes,
            kind,
            access,
        })
    }

    fn image_lease(&self, access: Access) -> Result<DeviceImage<'_>> {
        self.synchronize(Representation::Image, access)?;
        let (id, extents, format) = {
            let slot = self.image.borrow();
            let handle = slot.as_ref().ok_or_else(|| unallocated(Representation::Image))?;
            (handle.id, handle.extents, handle.format)
        };
        Ok(DeviceImage {
            tensor: self,
            id,
            extents,
            format,
            access,
        })
    }

    /// Allocate `repr` on first use, and reject allocations reclaimed by a pool reset.
    fn ensure_allocated(&self, repr: Representation) -> Result<()> {
        match repr {
            Representation::Buffer | Representation::Staging => {
                let cell = if repr == Representation::Buffer { &self.buffer } else { &self.staging };
                if let Some(handle) = cell.borrow().as_ref() {
                    return handle.check_validity();
                }
                let kind = if repr == Representation::Staging || !self.uses_staging {
                    MemoryKind::HostVisible
                } else {
                    MemoryKind::DeviceLocal
                };
                let handle = self.pool.allocate_buffer(self.nbytes(), kind)?;
                trace!(?repr, buffer = ?handle.id, bytes = handle.bytes, ?kind, "allocated representation");
                *cell.borrow_mut() = Some(handle);
            }
            Representation::Image => {
                if let Some(handle) = self.image.borrow().as_ref() {
                    return handle.check_validity();
                }
                let format = ImageFormat::for_dtype(self.options.dtype)?;
                let handle = self.pool.allocate_image(self.layout.extents(), format)?;
                trace!(image = ?handle.id, extents = ?handle.extents, "allocated representation");
                *self.image.borrow_mut() = Some(handle);
            }
        }
        Ok(())
    }

    fn buffer_id(&self, repr: Representation) -> Result<BufferId> {
        let cell = match repr {
            Representation::Buffer => &self.buffer,
            Representation::Staging => &self.staging,
            Representation::Image => return Err(CoherentError::InvalidState("images are not buffers".to_string())),
        };
        let slot = cell.borrow();
        let handle = slot.as_ref().ok_or_else(|| unallocated(repr))?;
        handle.check_validity()?;
        Ok(handle.id)
    }

    fn image_id(&self) -> Result<ImageId> {
        let slot = self.image.borrow();
        let handle = slot.as_ref().ok_or_else(|| unallocated(Representation::Image))?;
        handle.check_validity()?;
        Ok(handle.id)
    }

    /// Block on device work registered through `track_submission`.
    fn wait_pending(&self, backend: &Arc<dyn Backend>) -> Result<()> {
        let Some(submission) = self.pending.take() else {
            return Ok(());
        };
        backend.wait(submission).inspect_err(|_| self.pending.set(Some(submission)))
    }
}

fn unallocated(repr: Representation) -> CoherentError {
    CoherentError::InvalidState(format!("{repr:?} representation is not allocated"))
}

impl Drop for CoherentTensor {
    fn drop(&mut self) {
        // Outstanding device writes must finish before the allocations go back to the pool.
        if let Some(submission) = self.pending.take()
            && let Ok(context) = self.context.upgrade()
            && let Err(err) = context.backend().wait(submission)
        {
            warn!(%err, "device work on a dropped tensor failed");
        }
    }
}

impl fmt::Debug for CoherentTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoherentTensor")
            .field("sizes", &self.sizes)
            .field("dtype", &self.options.dtype)
            .field("dirty", &self.dirty.get())
            .field("uses_staging", &self.uses_staging)
            .finish()
    }
}

/// The device buffer of a tensor, borrowed for as long as the caller uses it.
#[derive(Debug)]
pub struct DeviceBuffer<'a> {
    tensor: &'a CoherentTensor,
    id: BufferId,
    bytes: usize,
    kind: MemoryKind,
    access: Access,
}

impl DeviceBuffer<'_> {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Allocated size in bytes (at least the tensor's `nbytes`).
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Register a submission that writes this buffer.
    pub fn track_submission(&self, submission: SubmissionId) -> Result<()> {
        if !self.access.writes() {
            return Err(CoherentError::AccessViolation {
                requested: Access::WRITE,
                granted: self.access,
            });
        }
        self.tensor.pending.set(Some(submission));
        Ok(())
    }
}

/// The device image of a tensor, borrowed for as long as the caller uses it.
#[derive(Debug)]
pub struct DeviceImage<'a> {
    tensor: &'a CoherentTensor,
    id: ImageId,
    extents: ImageExtents,
    format: ImageFormat,
    access: Access,
}

impl DeviceImage<'_> {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn extents(&self) -> ImageExtents {
        self.extents
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn track_submission(&self, submission: SubmissionId) -> Result<()> {
        if !self.access.writes() {
            return Err(CoherentError::AccessViolation {
                requested: Access::WRITE,
                granted: self.access,
            });
        }
        self.tensor.pending.set(Some(submission));
        Ok(())
    }
}

#[cfg(test)]
#[path = "tensor.test.rs"]
mod tests;
