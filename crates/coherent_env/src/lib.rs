//! Typed process-environment access shared by the coherent tensor crates.

pub mod environment;

pub use environment::{
    EnvVar, Environment, guard::EnvVarGuard, instrument::{InstrumentEnvVar, LOG_LEVEL, METRICS_CONSOLE, METRICS_JSONL_PATH}, runtime::{
        BACKEND, BackendSetting, FORCE_STAGING, PERSISTENT_POOL_MAX_MB, RuntimeEnvVar, WRITEBACK, WritebackSetting
    }, value::{EnvVarError, EnvVarFormatError, EnvVarParseError, TypedEnvVar, TypedEnvVarGuard}
};
