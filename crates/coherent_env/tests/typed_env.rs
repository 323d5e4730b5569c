use std::sync::OnceLock;

use coherent_env::{
    BACKEND, BackendSetting, EnvVarError, EnvVarGuard, Environment, FORCE_STAGING, InstrumentEnvVar, LOG_LEVEL, PERSISTENT_POOL_MAX_MB, RuntimeEnvVar, WRITEBACK, WritebackSetting
};
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn guards_restore_previous_values() {
    let _clear = EnvVarGuard::unset(RuntimeEnvVar::Writeback);
    {
        let _eager = EnvVarGuard::set(RuntimeEnvVar::Writeback, "eager");
        {
            let _deferred = WRITEBACK.set_guard(WritebackSetting::Deferred).expect("format writeback");
            assert_eq!(Environment::get(RuntimeEnvVar::Writeback).as_deref(), Some("deferred"));
        }
        assert_eq!(WRITEBACK.get().expect("parse writeback"), Some(WritebackSetting::Eager));
    }
    assert_eq!(Environment::get(RuntimeEnvVar::Writeback), None);
}

#[test]
#[serial]
fn malformed_values_are_reported_with_key_and_raw_value() {
    let _backend = EnvVarGuard::set(RuntimeEnvVar::Backend, "vulkan");
    match BACKEND.get() {
        Err(EnvVarError::Parse { name, value, .. }) => {
            assert_eq!(name, "COHERENT_BACKEND");
            assert_eq!(value, "vulkan");
        }
        other => panic!("expected parse error, got {other:?}"),
    }

    let _max = EnvVarGuard::set(RuntimeEnvVar::PersistentPoolMaxMb, "lots");
    assert!(PERSISTENT_POOL_MAX_MB.get().is_err());
    assert!(PERSISTENT_POOL_MAX_MB.get_or(4).is_err());
}

#[test]
#[serial]
fn typed_values_parse_case_insensitively() {
    let _backend = EnvVarGuard::set(RuntimeEnvVar::Backend, " Metal ");
    assert_eq!(BACKEND.get().expect("parse backend"), Some(BackendSetting::Metal));

    let _staging = EnvVarGuard::set(RuntimeEnvVar::ForceStaging, "YES");
    assert_eq!(FORCE_STAGING.get().expect("parse flag"), Some(true));

    let _level = EnvVarGuard::set(InstrumentEnvVar::LogLevel, "debug");
    assert_eq!(LOG_LEVEL.get().expect("parse level"), Some(Level::DEBUG));

    let _unset = PERSISTENT_POOL_MAX_MB.unset_guard();
    assert_eq!(PERSISTENT_POOL_MAX_MB.get_or(64).expect("default applies"), 64);
}

#[test]
#[serial]
fn get_valid_cached_latches_first_value() {
    static CACHE: OnceLock<Option<usize>> = OnceLock::new();
    let _clear = EnvVarGuard::unset(RuntimeEnvVar::PersistentPoolMaxMb);

    {
        let _set = EnvVarGuard::set(RuntimeEnvVar::PersistentPoolMaxMb, "8");
        assert_eq!(PERSISTENT_POOL_MAX_MB.get_valid_cached(&CACHE), Some(8));
    }
    {
        let _set = EnvVarGuard::set(RuntimeEnvVar::PersistentPoolMaxMb, "16");
        assert_eq!(PERSISTENT_POOL_MAX_MB.get_valid_cached(&CACHE), Some(8));
    }
}
