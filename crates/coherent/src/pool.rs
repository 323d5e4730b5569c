//! Recycling allocator for device buffers and images.
//!
//! Every allocation comes back as a [`Handle`] whose release callback returns
//! it to a free list keyed by size (buffers) or extents and format (images),
//! so allocate/release cycles reuse device memory. A [`Reclamation::PerOperation`]
//! pool can additionally be [`reset`](ResourcePool::reset): every allocation is
//! destroyed and outstanding handles become stale, which they report through
//! `check_validity`. [`Reclamation::Persistent`] pools ignore resets.

use std::sync::{
    Arc, Mutex, MutexGuard, Weak, atomic::{AtomicU64, Ordering}
};

use coherent_instrumentation::{MetricEvent, PoolKind, ResourceKind, record_metric};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    CoherentError, Result, backend::{Backend, BufferId, ImageExtents, ImageFormat, ImageId, MemoryKind}, handle::Handle
};

const ALIGNMENT: usize = 256;

#[inline]
fn align(size: usize, alignment: usize) -> Result<usize> {
    size.max(1)
        .checked_next_multiple_of(alignment)
        .ok_or(CoherentError::OutOfMemory {
            requested: size,
            available: 0,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reclamation {
    /// Reclaimed wholesale by [`ResourcePool::reset`].
    PerOperation,
    /// Survives resets; allocations only return to the free list.
    Persistent,
}

impl Reclamation {
    fn metric_kind(self) -> PoolKind {
        match self {
            Reclamation::PerOperation => PoolKind::PerOperation,
            Reclamation::Persistent => PoolKind::Persistent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live_buffers: usize,
    pub live_images: usize,
    pub free_buffers: usize,
    pub free_images: usize,
    pub bytes_live: usize,
    pub bytes_free: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub resets: u64,
    pub reclaimed: u64,
}

/// Ties an allocation to the pool generation it was made in.
#[derive(Debug, Clone)]
struct Lease {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl Lease {
    fn check(&self, what: &str) -> Result<()> {
        if self.current.load(Ordering::Acquire) == self.generation {
            Ok(())
        } else {
            Err(CoherentError::InvalidState(format!("{what} used after its pool was reset")))
        }
    }
}

#[derive(Debug)]
pub struct BufferResource {
    pub id: BufferId,
    /// Allocated size, rounded up to the pool alignment.
    pub bytes: usize,
    pub kind: MemoryKind,
    lease: Lease,
}

impl BufferResource {
    pub fn check_validity(&self) -> Result<()> {
        self.lease.check("buffer")
    }

    pub fn generation(&self) -> u64 {
        self.lease.generation
    }
}

#[derive(Debug)]
pub struct ImageResource {
    pub id: ImageId,
    pub extents: ImageExtents,
    pub format: ImageFormat,
    pub bytes: usize,
    lease: Lease,
}

impl ImageResource {
    pub fn check_validity(&self) -> Result<()> {
        self.lease.check("image")
    }

    pub fn generation(&self) -> u64 {
        self.lease.generation
    }
}

#[derive(Default)]
struct PoolState {
    free_buffers: FxHashMap<(usize, MemoryKind), Vec<BufferId>>,
    free_images: FxHashMap<(ImageExtents, ImageFormat), Vec<ImageId>>,
    live_buffers: FxHashMap<BufferId, usize>,
    live_images: FxHashMap<ImageId, usize>,
    stats: PoolStats,
}

struct PoolInner {
    backend: Arc<dyn Backend>,
    reclamation: Reclamation,
    generation: Arc<AtomicU64>,
    limit: Option<usize>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("resource pool mutex poisoned")
    }

    fn lease(&self) -> Lease {
        Lease {
            generation: self.generation.load(Ordering::Acquire),
            current: self.generation.clone(),
        }
    }

    /// Make room for `bytes` under the limit, evicting free allocations first.
    fn reserve(&self, state: &mut PoolState, bytes: usize) -> Result<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        if (state.stats.bytes_live + state.stats.bytes_free).saturating_add(bytes) > limit {
            self.destroy_free(state);
        }
        let used = state.stats.bytes_live + state.stats.bytes_free;
        if used.saturating_add(bytes) > limit {
            return Err(CoherentError::OutOfMemory {
                requested: bytes,
                available: limit.saturating_sub(used),
            });
        }
        Ok(())
    }

    fn destroy_free(&self, state: &mut PoolState) -> u64 {
        let mut destroyed = 0;
        for id in state.free_buffers.drain().flat_map(|(_, ids)| ids) {
            self.backend.destroy_buffer(id);
            destroyed += 1;
        }
        for id in state.free_images.drain().flat_map(|(_, ids)| ids) {
            self.backend.destroy_image(id);
            destroyed += 1;
        }
        state.stats.bytes_free = 0;
        state.stats.free_buffers = 0;
        state.stats.free_images = 0;
        destroyed
    }

    fn destroy_live(&self, state: &mut PoolState) -> u64 {
        let mut destroyed = 0;
        for (id, _) in state.live_buffers.drain() {
            self.backend.destroy_buffer(id);
            destroyed += 1;
        }
        for (id, _) in state.live_images.drain() {
            self.backend.destroy_image(id);
            destroyed += 1;
        }
        state.stats.bytes_live = 0;
        state.stats.live_buffers = 0;
        state.stats.live_images = 0;
        destroyed
    }

    fn recycle_buffer(&self, resource: BufferResource) {
        let mut state = self.lock();
        if resource.check_validity().is_err() {
            // Already destroyed by a reset.
            return;
        }
        if state.live_buffers.remove(&resource.id).is_none() {
            return;
        }
        state.stats.live_buffers -= 1;
        state.stats.bytes_live -= resource.bytes;
        state.stats.free_buffers += 1;
        state.stats.bytes_free += resource.bytes;
        state
            .free_buffers
            .entry((resource.bytes, resource.kind))
            .or_default()
            .push(resource.id);
        trace!(buffer = ?resource.id, bytes = resource.bytes, "buffer returned to pool");
    }

    fn recycle_image(&self, resource: ImageResource) {
        let mut state = self.lock();
        if resource.check_validity().is_err() || state.live_images.remove(&resource.id).is_none() {
            return;
        }
        state.stats.live_images -= 1;
        state.stats.bytes_live -= resource.bytes;
        state.stats.free_images += 1;
        state.stats.bytes_free += resource.bytes;
        state
            .free_images
            .entry((resource.extents, resource.format))
            .or_default()
            .push(resource.id);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = std::mem::take(self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let destroyed = self.destroy_free(&mut state) + self.destroy_live(&mut state);
        debug!(reclamation = ?self.reclamation, destroyed, "resource pool dropped");
    }
}

/// Shared handle to a recycling allocator on one backend.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    pub fn new(backend: Arc<dyn Backend>, reclamation: Reclamation) -> Self {
        Self::with_limit(backend, reclamation, None)
    }

    /// A pool that refuses to hold more than `limit` bytes, live and free combined.
    pub fn with_limit(backend: Arc<dyn Backend>, reclamation: Reclamation, limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                reclamation,
                generation: Arc::new(AtomicU64::new(0)),
                limit,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn reclamation(&self) -> Reclamation {
        self.inner.reclamation
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    pub fn allocate_buffer(&self, bytes: usize, kind: MemoryKind) -> Result<Handle<BufferResource>> {
        let aligned = align(bytes, ALIGNMENT)?;
        let inner = &self.inner;
        let mut state = inner.lock();

        let recycled = state.free_buffers.get_mut(&(aligned, kind)).and_then(Vec::pop);
        let reused = recycled.is_some();
        let id = match recycled {
            Some(id) => {
                state.stats.free_buffers -= 1;
                state.stats.bytes_free -= aligned;
                id
            }
            None => {
                inner.reserve(&mut state, aligned)?;
                inner.backend.create_buffer(aligned, kind)?
            }
        };

        state.live_buffers.insert(id, aligned);
        state.stats.live_buffers += 1;
        state.stats.bytes_live += aligned;
        state.stats.allocations += 1;
        if reused {
            state.stats.reuses += 1;
        }
        let resource = BufferResource {
            id,
            bytes: aligned,
            kind,
            lease: inner.lease(),
        };
        drop(state);

        record_metric!(MetricEvent::PoolAllocation {
            pool: inner.reclamation.metric_kind(),
            resource: ResourceKind::Buffer,
            bytes: aligned as u64,
            reused,
        });

        let pool = Arc::downgrade(inner);
        Ok(Handle::new(resource, move |resource| {
            if let Some(pool) = Weak::upgrade(&pool) {
                pool.recycle_buffer(resource);
            }
        }))
    }

    pub fn allocate_image(&self, extents: ImageExtents, format: ImageFormat) -> Result<Handle<ImageResource>> {
        let bytes = extents.byte_size(format)?;
        let inner = &self.inner;
        let mut state = inner.lock();

        let recycled = state.free_images.get_mut(&(extents, format)).and_then(Vec::pop);
        let reused = recycled.is_some();
        let id = match recycled {
            Some(id) => {
                state.stats.free_images -= 1;
                state.stats.bytes_free -= bytes;
                id
            }
            None => {
                inner.reserve(&mut state, bytes)?;
                inner.backend.create_image(extents, format)?
            }
        };

        state.live_images.insert(id, bytes);
        state.stats.live_images += 1;
        state.stats.bytes_live += bytes;
        state.stats.allocations += 1;
        if reused {
            state.stats.reuses += 1;
        }
        let resource = ImageResource {
            id,
            extents,
            format,
            bytes,
            lease: inner.lease(),
        };
        drop(state);

        record_metric!(MetricEvent::PoolAllocation {
            pool: inner.reclamation.metric_kind(),
            resource: ResourceKind::Image,
            bytes: bytes as u64,
            reused,
        });

        let pool = Arc::downgrade(inner);
        Ok(Handle::new(resource, move |resource| {
            if let Some(pool) = Weak::upgrade(&pool) {
                pool.recycle_image(resource);
            }
        }))
    }

    /// Destroy every allocation of a per-operation pool and invalidate outstanding handles.
    ///
    /// Returns the number of allocations destroyed. Persistent pools are left untouched.
    pub fn reset(&self) -> u64 {
        let inner = &self.inner;
        if inner.reclamation == Reclamation::Persistent {
            trace!("reset ignored by persistent pool");
            return 0;
        }
        let mut state = inner.lock();
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let reclaimed = inner.destroy_live(&mut state) + inner.destroy_free(&mut state);
        state.stats.resets += 1;
        state.stats.reclaimed += reclaimed;
        drop(state);

        debug!(generation, reclaimed, "per-operation pool reset");
        record_metric!(MetricEvent::PoolReset {
            pool: inner.reclamation.metric_kind(),
            generation,
            reclaimed,
        });
        reclaimed
    }

    /// Destroy free-listed allocations without touching live ones.
    pub fn trim(&self) -> u64 {
        let mut state = self.inner.lock();
        self.inner.destroy_free(&mut state)
    }
}

#[cfg(test)]
#[path = "pool.test.rs"]
mod tests;
