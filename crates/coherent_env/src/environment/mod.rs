//! Process environment facade and variable identifiers.

mod codec;
pub mod guard;
pub mod instrument;
pub mod runtime;
pub mod value;

use std::sync::{Mutex, MutexGuard, OnceLock};

use instrument::InstrumentEnvVar;
use runtime::RuntimeEnvVar;

/// Namespaced environment variable identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvVar {
    /// Logging and metrics settings.
    Instrument(InstrumentEnvVar),
    /// Settings consumed by the tensor runtime (backend choice, writeback, pools).
    Runtime(RuntimeEnvVar),
}

impl From<InstrumentEnvVar> for EnvVar {
    fn from(value: InstrumentEnvVar) -> Self {
        Self::Instrument(value)
    }
}

impl From<RuntimeEnvVar> for EnvVar {
    fn from(value: RuntimeEnvVar) -> Self {
        Self::Runtime(value)
    }
}

impl EnvVar {
    /// Canonical process-environment key.
    pub const fn key(self) -> &'static str {
        match self {
            EnvVar::Instrument(inner) => inner.key(),
            EnvVar::Runtime(inner) => inner.key(),
        }
    }
}

/// Serialises every mutation of the process environment behind one mutex.
pub struct Environment;

impl Environment {
    /// Acquire the global environment mutex.
    pub fn lock() -> MutexGuard<'static, ()> {
        static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_MUTEX.get_or_init(|| Mutex::new(())).lock().expect("environment mutex poisoned")
    }

    /// Read the variable as UTF-8, `None` when unset or not valid unicode.
    pub fn get(var: impl Into<EnvVar>) -> Option<String> {
        std::env::var(var.into().key()).ok()
    }

    /// Set a variable, taking the environment lock for the duration of the call.
    pub fn set(var: impl Into<EnvVar>, value: &str) {
        let var = var.into();
        let mut guard = Self::lock();
        Self::set_locked(var, value, &mut guard);
    }

    /// Remove a variable, taking the environment lock for the duration of the call.
    pub fn remove(var: impl Into<EnvVar>) {
        let var = var.into();
        let mut guard = Self::lock();
        Self::remove_locked(var, &mut guard);
    }

    pub(crate) fn set_locked(var: EnvVar, value: &str, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: holding the environment mutex serialises all mutation done through this facade.
        unsafe { std::env::set_var(var.key(), value) };
    }

    pub(crate) fn remove_locked(var: EnvVar, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: see `set_locked`.
        unsafe { std::env::remove_var(var.key()) };
    }
}
