//! Allocations that outlive a single operation.

use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{debug, error};

use crate::{
    CoherentError, Result, backend::{ImageExtents, ImageFormat, MemoryKind}, context::{Context, ContextRef}, handle::Handle, options::{self, TensorOptions}, pool::{BufferResource, ImageResource, Reclamation, ResourcePool}
};

/// A pool whose allocations are exempt from [`Context::flush`].
///
/// Use it for data reused across many operations, such as weights. Handles
/// return their allocation to this pool when released, so repeated
/// allocate/release cycles do not hit the device allocator.
pub struct PersistentPool {
    context: ContextRef,
    pool: ResourcePool,
    unified: bool,
    // Set only for the process-wide instance, which owns its context.
    _owner: Option<Context>,
}

impl PersistentPool {
    pub fn new(context: &Context) -> Result<Self> {
        context.ensure_valid()?;
        let limit = context.config().persistent_pool_max_bytes;
        Ok(Self {
            context: context.downgrade(),
            pool: ResourcePool::with_limit(context.backend().clone(), Reclamation::Persistent, limit),
            unified: context.unified_memory(),
            _owner: None,
        })
    }

    /// Build from a possibly dangling context reference.
    pub fn from_ref(context: &ContextRef) -> Result<Self> {
        Self::new(&context.upgrade()?)
    }

    fn owning(context: Context) -> Result<Self> {
        let mut pool = Self::new(&context)?;
        pool._owner = Some(context);
        Ok(pool)
    }

    pub fn context(&self) -> Result<Context> {
        self.context.upgrade()
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// A device buffer large enough for `sizes` elements of `options.dtype`.
    pub fn buffer(&self, sizes: &[usize], options: &TensorOptions) -> Result<Handle<BufferResource>> {
        self.context.upgrade()?;
        options::verify(options)?;
        let bytes = options::byte_size(sizes, options.dtype)?;
        let kind = if self.unified {
            MemoryKind::HostVisible
        } else {
            MemoryKind::DeviceLocal
        };
        self.pool.allocate_buffer(bytes, kind)
    }

    /// A host-visible buffer for staging `sizes` elements.
    pub fn staging(&self, sizes: &[usize], options: &TensorOptions) -> Result<Handle<BufferResource>> {
        self.context.upgrade()?;
        options::verify(options)?;
        let bytes = options::byte_size(sizes, options.dtype)?;
        self.pool.allocate_buffer(bytes, MemoryKind::HostVisible)
    }

    /// An RGBA image of `extents` in the format matching `options.dtype`.
    pub fn image(&self, extents: ImageExtents, options: &TensorOptions) -> Result<Handle<ImageResource>> {
        self.context.upgrade()?;
        options::verify(options)?;
        self.pool.allocate_image(extents, ImageFormat::for_dtype(options.dtype)?)
    }
}

static PERSISTENT: OnceLock<Mutex<PersistentPool>> = OnceLock::new();
// Serialises first use so only one system context is ever created.
static PERSISTENT_INIT: Mutex<()> = Mutex::new(());

/// The process-wide persistent pool, built on [`Context::system_default`] at first use.
///
/// A failed construction is not cached; the next call tries again.
pub fn persistent() -> Result<MutexGuard<'static, PersistentPool>> {
    if PERSISTENT.get().is_none() {
        let _init = PERSISTENT_INIT
            .lock()
            .map_err(|_| CoherentError::InvalidState("persistent pool initialisation poisoned".to_string()))?;
        if PERSISTENT.get().is_none() {
            let pool = Context::system_default().and_then(PersistentPool::owning).inspect_err(|err| {
                error!(%err, "failed to create the persistent pool");
            })?;
            debug!(unified = pool.unified, "persistent pool created");
            let _ = PERSISTENT.set(Mutex::new(pool));
        }
    }
    PERSISTENT
        .get()
        .ok_or_else(|| CoherentError::InvalidState("persistent pool unavailable".to_string()))?
        .lock()
        .map_err(|_| CoherentError::InvalidState("persistent pool mutex poisoned".to_string()))
}
