//! Environment variables read by the tensor runtime when building its configuration.

use std::{fmt, str::FromStr};

use super::{
    EnvVar, codec::{format_display, parse_bool, parse_usize}, value::{EnvVarParseError, TypedEnvVar}
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeEnvVar {
    /// `eager` or `deferred` host writeback when a write future ends.
    Writeback,
    /// Keep a dedicated host staging buffer even on unified-memory devices.
    ForceStaging,
    /// Backend used by the system default context (`host` or `metal`).
    Backend,
    /// Upper bound, in MiB, on memory held by the persistent pool.
    PersistentPoolMaxMb,
}

impl RuntimeEnvVar {
    pub const fn key(self) -> &'static str {
        match self {
            RuntimeEnvVar::Writeback => "COHERENT_WRITEBACK",
            RuntimeEnvVar::ForceStaging => "COHERENT_FORCE_STAGING",
            RuntimeEnvVar::Backend => "COHERENT_BACKEND",
            RuntimeEnvVar::PersistentPoolMaxMb => "COHERENT_PERSISTENT_POOL_MAX_MB",
        }
    }

    pub const fn into_env(self) -> EnvVar {
        EnvVar::Runtime(self)
    }
}

/// When host-side writes are pushed back toward the device buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WritebackSetting {
    /// Upload when the write future is dropped.
    Eager,
    /// Leave the upload to the next device-side read.
    #[default]
    Deferred,
}

impl fmt::Display for WritebackSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WritebackSetting::Eager => "eager",
            WritebackSetting::Deferred => "deferred",
        })
    }
}

impl FromStr for WritebackSetting {
    type Err = EnvVarParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(WritebackSetting::Eager),
            "deferred" | "lazy" => Ok(WritebackSetting::Deferred),
            _ => Err(EnvVarParseError::new("expected 'eager' or 'deferred'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendSetting {
    Host,
    Metal,
}

impl fmt::Display for BackendSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendSetting::Host => "host",
            BackendSetting::Metal => "metal",
        })
    }
}

impl FromStr for BackendSetting {
    type Err = EnvVarParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(BackendSetting::Host),
            "metal" => Ok(BackendSetting::Metal),
            _ => Err(EnvVarParseError::new("expected 'host' or 'metal'")),
        }
    }
}

/// `COHERENT_WRITEBACK`
pub const WRITEBACK: TypedEnvVar<WritebackSetting> =
    TypedEnvVar::new(RuntimeEnvVar::Writeback.into_env(), WritebackSetting::from_str, format_display);
/// `COHERENT_FORCE_STAGING`
pub const FORCE_STAGING: TypedEnvVar<bool> = TypedEnvVar::new(RuntimeEnvVar::ForceStaging.into_env(), parse_bool, format_display);
/// `COHERENT_BACKEND`
pub const BACKEND: TypedEnvVar<BackendSetting> =
    TypedEnvVar::new(RuntimeEnvVar::Backend.into_env(), BackendSetting::from_str, format_display);
/// `COHERENT_PERSISTENT_POOL_MAX_MB`
pub const PERSISTENT_POOL_MAX_MB: TypedEnvVar<usize> =
    TypedEnvVar::new(RuntimeEnvVar::PersistentPoolMaxMb.into_env(), parse_usize, format_display);
