//! Logging and metrics environment variables.

use std::path::PathBuf;

use tracing::Level;

use super::{
    EnvVar, codec::{format_display, format_path, parse_bool, parse_path}, value::{EnvVarParseError, TypedEnvVar}
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentEnvVar {
    /// Minimum tracing level for the fmt layer.
    LogLevel,
    /// Append metric events as JSON lines to this path.
    MetricsJsonlPath,
    /// Print metric events to stdout.
    MetricsConsole,
}

impl InstrumentEnvVar {
    pub const fn key(self) -> &'static str {
        match self {
            InstrumentEnvVar::LogLevel => "COHERENT_LOG_LEVEL",
            InstrumentEnvVar::MetricsJsonlPath => "COHERENT_METRICS_JSONL_PATH",
            InstrumentEnvVar::MetricsConsole => "COHERENT_METRICS_CONSOLE",
        }
    }

    pub const fn into_env(self) -> EnvVar {
        EnvVar::Instrument(self)
    }
}

/// `COHERENT_LOG_LEVEL`
pub const LOG_LEVEL: TypedEnvVar<Level> = TypedEnvVar::new(InstrumentEnvVar::LogLevel.into_env(), parse_log_level, format_display);
/// `COHERENT_METRICS_JSONL_PATH`
pub const METRICS_JSONL_PATH: TypedEnvVar<PathBuf> =
    TypedEnvVar::new(InstrumentEnvVar::MetricsJsonlPath.into_env(), parse_path, format_path);
/// `COHERENT_METRICS_CONSOLE`
pub const METRICS_CONSOLE: TypedEnvVar<bool> = TypedEnvVar::new(InstrumentEnvVar::MetricsConsole.into_env(), parse_bool, format_display);

fn parse_log_level(value: &str) -> Result<Level, EnvVarParseError> {
    value.trim().parse::<Level>().map_err(|_| EnvVarParseError::new("invalid tracing level"))
}
