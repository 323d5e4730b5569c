use coherent_env::{EnvVarGuard, InstrumentEnvVar};
use serial_test::serial;

use crate::prelude::*;

#[test]
#[serial]
fn app_config_parses_environment() {
    let _level = EnvVarGuard::set(InstrumentEnvVar::LogLevel, "debug");
    let _path = EnvVarGuard::set(InstrumentEnvVar::MetricsJsonlPath, "/tmp/coherent-metrics.jsonl");
    let _console = EnvVarGuard::set(InstrumentEnvVar::MetricsConsole, "on");

    let config = AppConfig::from_env().expect("configuration should parse");
    assert_eq!(config.log_level, Level::DEBUG);
    assert_eq!(
        config.metrics_jsonl_path.as_deref(),
        Some(std::path::Path::new("/tmp/coherent-metrics.jsonl"))
    );
    assert!(config.enable_console_metrics);
    assert!(config.metrics_enabled());
}

#[test]
#[serial]
fn app_config_defaults_when_unset() {
    let _level = EnvVarGuard::unset(InstrumentEnvVar::LogLevel);
    let _path = EnvVarGuard::unset(InstrumentEnvVar::MetricsJsonlPath);
    let _console = EnvVarGuard::unset(InstrumentEnvVar::MetricsConsole);

    let config = AppConfig::from_env().expect("defaults should apply");
    assert_eq!(config, AppConfig::default());
    assert!(!config.metrics_enabled());
}

#[test]
#[serial]
fn app_config_rejects_malformed_values() {
    let _path = EnvVarGuard::unset(InstrumentEnvVar::MetricsJsonlPath);
    let _console = EnvVarGuard::unset(InstrumentEnvVar::MetricsConsole);
    {
        let _level = EnvVarGuard::set(InstrumentEnvVar::LogLevel, "verbose");
        match AppConfig::from_env() {
            Err(AppConfigError::InvalidLogLevel { value }) => assert_eq!(value, "verbose"),
            other => panic!("expected invalid log level error, got {other:?}"),
        }
    }

    let _level = EnvVarGuard::unset(InstrumentEnvVar::LogLevel);
    let _console = EnvVarGuard::set(InstrumentEnvVar::MetricsConsole, "maybe");
    match AppConfig::from_env() {
        Err(AppConfigError::InvalidBoolean { name, value }) => {
            assert_eq!(name, InstrumentEnvVar::MetricsConsole.key());
            assert_eq!(value, "maybe");
        }
        other => panic!("expected invalid boolean error, got {other:?}"),
    }
}

#[test]
fn exporters_follow_configuration() {
    let none = metric_exporters(&AppConfig::default()).expect("no exporters");
    assert!(none.is_empty());

    let console = AppConfig {
        enable_console_metrics: true,
        ..AppConfig::default()
    };
    assert_eq!(metric_exporters(&console).expect("console exporter").len(), 1);

    let unwritable = AppConfig {
        metrics_jsonl_path: Some("/nonexistent-dir/coherent/metrics.jsonl".into()),
        ..AppConfig::default()
    };
    assert!(matches!(metric_exporters(&unwritable), Err(LoggingError::JsonlExporter { .. })));
}
