//! Runtime configuration for contexts and tensors.

use coherent_env::{BACKEND, BackendSetting, FORCE_STAGING, PERSISTENT_POOL_MAX_MB, WRITEBACK};

use crate::Result;

/// When host writes made through a write future reach the device buffer.
pub use coherent_env::WritebackSetting as WritebackPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub writeback: WritebackPolicy,
    /// Keep a separate staging buffer even when host and device share memory.
    pub force_staging: bool,
    /// Backend built by [`Context::system_default`](crate::Context::system_default).
    pub backend: BackendSetting,
    pub persistent_pool_max_bytes: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            writeback: WritebackPolicy::Deferred,
            force_staging: false,
            backend: default_backend(),
            persistent_pool_max_bytes: None,
        }
    }
}

const fn default_backend() -> BackendSetting {
    if cfg!(target_os = "macos") {
        BackendSetting::Metal
    } else {
        BackendSetting::Host
    }
}

impl RuntimeConfig {
    /// Read the `COHERENT_*` runtime variables. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            writeback: WRITEBACK.get_or(defaults.writeback)?,
            force_staging: FORCE_STAGING.get_or(defaults.force_staging)?,
            backend: BACKEND.get_or(defaults.backend)?,
            persistent_pool_max_bytes: PERSISTENT_POOL_MAX_MB.get()?.map(|mb| mb.saturating_mul(1024 * 1024)),
        })
    }

    pub fn with_writeback(mut self, writeback: WritebackPolicy) -> Self {
        self.writeback = writeback;
        self
    }

    pub fn with_force_staging(mut self, force_staging: bool) -> Self {
        self.force_staging = force_staging;
        self
    }
}

#[cfg(test)]
mod tests {
    use coherent_env::{EnvVarGuard, RuntimeEnvVar};
    use serial_test::serial;

    use super::*;
    use crate::CoherentError;

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        let _writeback = EnvVarGuard::set(RuntimeEnvVar::Writeback, "eager");
        let _staging = EnvVarGuard::set(RuntimeEnvVar::ForceStaging, "1");
        let _backend = EnvVarGuard::set(RuntimeEnvVar::Backend, "host");
        let _max = EnvVarGuard::set(RuntimeEnvVar::PersistentPoolMaxMb, "2");

        let config = RuntimeConfig::from_env().expect("config should parse");
        assert_eq!(config.writeback, WritebackPolicy::Eager);
        assert!(config.force_staging);
        assert_eq!(config.backend, BackendSetting::Host);
        assert_eq!(config.persistent_pool_max_bytes, Some(2 * 1024 * 1024));
    }

    #[test]
    #[serial]
    fn from_env_defaults_and_rejects_garbage() {
        let _writeback = EnvVarGuard::unset(RuntimeEnvVar::Writeback);
        let _staging = EnvVarGuard::unset(RuntimeEnvVar::ForceStaging);
        let _backend = EnvVarGuard::unset(RuntimeEnvVar::Backend);
        let _max = EnvVarGuard::unset(RuntimeEnvVar::PersistentPoolMaxMb);
        assert_eq!(RuntimeConfig::from_env().unwrap(), RuntimeConfig::default());

        let _writeback = EnvVarGuard::set(RuntimeEnvVar::Writeback, "sometimes");
        assert!(matches!(RuntimeConfig::from_env(), Err(CoherentError::Config(_))));
    }
}
