//! Parse/format callbacks shared by the typed descriptors.

use std::{fmt::Display, path::PathBuf};

use super::value::{EnvVarFormatError, EnvVarParseError};

pub(crate) fn parse_bool(value: &str) -> Result<bool, EnvVarParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EnvVarParseError::new("value is not a recognised boolean")),
    }
}

pub(crate) fn parse_usize(value: &str) -> Result<usize, EnvVarParseError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| EnvVarParseError::new("value is not a valid usize"))
}

pub(crate) fn parse_path(value: &str) -> Result<PathBuf, EnvVarParseError> {
    if value.trim().is_empty() {
        return Err(EnvVarParseError::new("path must not be empty"));
    }
    Ok(PathBuf::from(value))
}

// Signature must match `FormatFn<PathBuf>`.
#[allow(clippy::ptr_arg)]
pub(crate) fn format_path(path: &PathBuf) -> Result<String, EnvVarFormatError> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| EnvVarFormatError::new("path is not valid UTF-8"))
}

pub(crate) fn format_display<T: Display>(value: &T) -> Result<String, EnvVarFormatError> {
    Ok(value.to_string())
}
