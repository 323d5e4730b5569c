//! Subscriber installation.

use std::{io, path::PathBuf, sync::OnceLock};

use tracing_subscriber::{
    Layer, filter::{LevelFilter, Targets}, layer::SubscriberExt, util::SubscriberInitExt
};

use crate::{
    config::AppConfig, exporters::{ConsoleExporter, JsonlExporter}, recorder::{METRICS_TARGET, MetricExporter, MetricsLayer}
};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open metrics file {path:?}: {source}")]
    JsonlExporter { path: PathBuf, source: io::Error },
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Build the exporters requested by `config`.
pub fn metric_exporters(config: &AppConfig) -> Result<Vec<Box<dyn MetricExporter>>, LoggingError> {
    let mut exporters: Vec<Box<dyn MetricExporter>> = Vec::new();
    if config.enable_console_metrics {
        exporters.push(Box::new(ConsoleExporter::new()));
    }
    if let Some(path) = &config.metrics_jsonl_path {
        let exporter = JsonlExporter::new(path).map_err(|source| LoggingError::JsonlExporter { path: path.clone(), source })?;
        exporters.push(Box::new(exporter));
    }
    Ok(exporters)
}

/// Install the global subscriber: a fmt layer at `config.log_level` plus a
/// [`MetricsLayer`] when exporters are configured.
///
/// Returns `Ok(true)` when this call installed the subscriber and `Ok(false)`
/// when one was already in place.
pub fn init_tracing(config: &AppConfig) -> Result<bool, LoggingError> {
    if INSTALLED.get().is_some() {
        return Ok(false);
    }

    let exporters = metric_exporters(config)?;
    let fmt_filter = Targets::new()
        .with_target(METRICS_TARGET, LevelFilter::OFF)
        .with_default(LevelFilter::from_level(config.log_level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_filter(fmt_filter);
    let metrics_layer = (!exporters.is_empty()).then(|| MetricsLayer::new(exporters));

    let installed = tracing_subscriber::registry().with(fmt_layer).with(metrics_layer).try_init().is_ok();
    let _ = INSTALLED.set(installed);
    Ok(installed)
}
