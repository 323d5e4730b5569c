//! Typed environment variable descriptors.
//!
//! A [`TypedEnvVar`] pairs an [`EnvVar`] identifier with parse/format
//! callbacks so configuration code reads and writes real types instead of
//! strings. Malformed values surface as [`EnvVarError::Parse`] rather than
//! being ignored.
//!
//! ```
//! use coherent_env::{WRITEBACK, WritebackSetting};
//!
//! let guard = WRITEBACK.set_guard(WritebackSetting::Eager).expect("set writeback");
//! assert_eq!(*guard, WritebackSetting::Eager);
//! assert_eq!(WRITEBACK.get().expect("parse"), Some(WritebackSetting::Eager));
//! ```

use std::{fmt, ops::Deref, sync::OnceLock};

use super::{EnvVar, Environment, guard::EnvVarGuard};

/// Errors produced while reading or writing a typed variable.
#[derive(Debug, thiserror::Error)]
pub enum EnvVarError {
    #[error("failed to parse environment variable {name} from '{value}': {source}")]
    Parse {
        name: &'static str,
        value: String,
        source: EnvVarParseError,
    },
    #[error("failed to format environment variable {name}: {source}")]
    Format { name: &'static str, source: EnvVarFormatError },
}

macro_rules! message_error {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(String);

        impl $name {
            pub fn new(message: impl Into<String>) -> Self {
                Self(message.into())
            }

            pub fn message(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::error::Error for $name {}

        impl From<&'static str> for $name {
            fn from(value: &'static str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

message_error!(
    /// Returned by a descriptor's parse callback.
    EnvVarParseError
);
message_error!(
    /// Returned by a descriptor's format callback.
    EnvVarFormatError
);

pub type ParseFn<T> = fn(&str) -> Result<T, EnvVarParseError>;
pub type FormatFn<T> = fn(&T) -> Result<String, EnvVarFormatError>;

/// Descriptor for a strongly-typed environment variable.
pub struct TypedEnvVar<T> {
    var: EnvVar,
    parse: ParseFn<T>,
    format: FormatFn<T>,
}

impl<T> Clone for TypedEnvVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedEnvVar<T> {}

impl<T> TypedEnvVar<T> {
    pub const fn new(var: EnvVar, parse: ParseFn<T>, format: FormatFn<T>) -> Self {
        Self { var, parse, format }
    }

    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.var.key()
    }

    #[must_use]
    pub const fn var(&self) -> EnvVar {
        self.var
    }

    fn format_value(&self, value: &T) -> Result<String, EnvVarError> {
        (self.format)(value).map_err(|source| EnvVarError::Format { name: self.key(), source })
    }

    /// Read and parse the variable; `Ok(None)` when it is unset.
    pub fn get(&self) -> Result<Option<T>, EnvVarError> {
        let Some(raw) = Environment::get(self.var) else {
            return Ok(None);
        };
        (self.parse)(&raw).map(Some).map_err(|source| EnvVarError::Parse {
            name: self.key(),
            value: raw,
            source,
        })
    }

    /// Read the variable or fall back to `default` when unset. Malformed values are still errors.
    pub fn get_or(&self, default: T) -> Result<T, EnvVarError> {
        Ok(self.get()?.unwrap_or(default))
    }

    /// Read the variable, panicking on malformed values.
    #[must_use]
    pub fn get_valid(&self) -> Option<T> {
        self.get()
            .unwrap_or_else(|err| panic!("Invalid environment value for {}: {err}", self.key()))
    }

    /// Latch the first validated read into `cache`; later environment changes are not observed.
    #[must_use]
    pub fn get_valid_cached(&self, cache: &'static OnceLock<Option<T>>) -> Option<T>
    where
        T: Clone,
    {
        cache.get_or_init(|| self.get_valid()).clone()
    }

    pub fn set(&self, value: T) -> Result<(), EnvVarError> {
        let formatted = self.format_value(&value)?;
        Environment::set(self.var, &formatted);
        Ok(())
    }

    pub fn unset(&self) {
        Environment::remove(self.var);
    }

    /// Set the variable until the returned guard drops.
    pub fn set_guard(&self, value: T) -> Result<TypedEnvVarGuard<T>, EnvVarError> {
        let formatted = self.format_value(&value)?;
        let raw = EnvVarGuard::set(self.var, &formatted);
        Ok(TypedEnvVarGuard { _raw: raw, value })
    }

    /// Unset the variable until the returned guard drops.
    #[must_use]
    pub fn unset_guard(&self) -> EnvVarGuard {
        EnvVarGuard::unset(self.var)
    }
}

/// Restores the previous raw value on drop and dereferences to the typed value that was set.
pub struct TypedEnvVarGuard<T> {
    _raw: EnvVarGuard,
    value: T,
}

impl<T> TypedEnvVarGuard<T> {
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for TypedEnvVarGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
