//! Execution context: one backend, its per-operation pool and runtime settings.

use std::{
    fmt, sync::{
        Arc, Weak, atomic::{AtomicBool, AtomicU64, Ordering}
    }
};

use coherent_env::BackendSetting;
use tracing::{info, warn};

use crate::{
    CoherentError, Result, backend::{Backend, host::HostBackend}, config::RuntimeConfig, pool::{Reclamation, ResourcePool}
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: u64,
    backend: Arc<dyn Backend>,
    pool: ResourcePool,
    config: RuntimeConfig,
    lost: AtomicBool,
}

/// Shared handle to an execution context. Cloning is cheap.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, RuntimeConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let pool = ResourcePool::new(backend.clone(), Reclamation::PerOperation);
        Self {
            inner: Arc::new(ContextInner {
                id,
                backend,
                pool,
                config,
                lost: AtomicBool::new(false),
            }),
        }
    }

    /// Build a context on the backend selected by `COHERENT_BACKEND`.
    pub fn system_default() -> Result<Self> {
        let config = RuntimeConfig::from_env()?;
        let backend: Arc<dyn Backend> = match config.backend {
            BackendSetting::Host => Arc::new(HostBackend::discrete()),
            #[cfg(target_os = "macos")]
            BackendSetting::Metal => Arc::new(crate::backend::metal::MetalBackend::system_default()?),
            #[cfg(not(target_os = "macos"))]
            BackendSetting::Metal => {
                return Err(CoherentError::BackendUnavailable("metal requires macOS".to_string()));
            }
        };
        info!(backend = backend.name(), unified = backend.unified_memory(), "created default context");
        Ok(Self::with_config(backend, config))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// The pool reclaimed by [`Context::flush`].
    pub fn pool(&self) -> &ResourcePool {
        &self.inner.pool
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn unified_memory(&self) -> bool {
        self.inner.backend.unified_memory()
    }

    /// End the current operation: every per-operation allocation is reclaimed.
    pub fn flush(&self) -> u64 {
        self.inner.pool.reset()
    }

    /// Mark the device as lost. Every later use through a [`ContextRef`] fails.
    pub fn mark_lost(&self) {
        if !self.inner.lost.swap(true, Ordering::AcqRel) {
            warn!(context = self.inner.id, "execution context marked lost");
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.lost.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> ContextRef {
        ContextRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoherentError::InvalidContext(format!("context {} was lost", self.inner.id)))
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name())
            .field("lost", &!self.is_valid())
            .finish()
    }
}

/// Non-owning reference to a [`Context`]. The default value refers to no context.
#[derive(Clone, Default)]
pub struct ContextRef {
    inner: Weak<ContextInner>,
}

impl ContextRef {
    /// The referenced context, if it is still alive and not lost.
    pub fn upgrade(&self) -> Result<Context> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| CoherentError::InvalidContext("execution context has been dropped".to_string()))?;
        let context = Context { inner };
        context.ensure_valid()?;
        Ok(context)
    }

    pub fn is_null(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.upgrade() {
            Some(inner) => write!(f, "ContextRef({})", inner.id),
            None => f.write_str("ContextRef(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::backend::MemoryKind;

    #[test]
    fn flush_reclaims_per_operation_allocations() {
        let backend = Arc::new(HostBackend::discrete());
        let context = Context::new(backend.clone());
        let buffer = context.pool().allocate_buffer(16, MemoryKind::DeviceLocal).unwrap();
        assert_eq!(context.flush(), 1);
        assert!(buffer.check_validity().is_err());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn refs_fail_once_the_context_is_lost_or_dropped() {
        let context = Context::new(Arc::new(HostBackend::unified()));
        let weak = context.downgrade();
        assert_eq!(weak.upgrade().unwrap().id(), context.id());

        context.mark_lost();
        assert!(matches!(weak.upgrade(), Err(CoherentError::InvalidContext(_))));

        drop(context);
        assert!(weak.is_null());
        assert!(matches!(ContextRef::default().upgrade(), Err(CoherentError::InvalidContext(_))));
    }

    #[test]
    #[serial]
    fn system_default_honours_backend_override() {
        let _backend = coherent_env::EnvVarGuard::set(coherent_env::RuntimeEnvVar::Backend, "host");
        let context = Context::system_default().expect("host backend is always available");
        assert_eq!(context.backend().name(), "host");
        assert!(!context.unified_memory());
    }
}
