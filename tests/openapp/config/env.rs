use openapp::openapp::config::{Config, ControllerSettings, DEFAULT_SYNC_INTERVAL};
use openapp::openapp::logger::LogFormat;
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const ALL: [Config; 7] = [
    Config::RegistryCache,
    Config::InstanceNamespace,
    Config::SystemNamespace,
    Config::SystemConfigMap,
    Config::NodeAddress,
    Config::SyncInterval,
    Config::LogFormat,
];

/// Clears every controller variable on creation and again on drop.
struct CleanEnv;

impl CleanEnv {
    fn new() -> Self {
        clear();
        CleanEnv
    }
}

impl Drop for CleanEnv {
    fn drop(&mut self) {
        clear();
    }
}

fn clear() {
    for config in ALL {
        env::remove_var(config.env_var());
    }
}

#[test]
#[serial]
fn unset_environment_uses_defaults() {
    let _env = CleanEnv::new();
    let settings = ControllerSettings::from_env().expect("settings");
    assert_eq!(settings.instance_namespace, "openapp");
    assert_eq!(settings.system_namespace, "openapp-system");
    assert_eq!(settings.system_configmap, "openapp-config");
    assert_eq!(settings.sync_interval, DEFAULT_SYNC_INTERVAL);
    assert_eq!(settings.log_format, LogFormat::Text);
    assert!(settings.node_address.is_none());
}

#[test]
#[serial]
fn environment_overrides_every_parameter() {
    let _env = CleanEnv::new();
    env::set_var("OPENAPP_REGISTRY_CACHE", "/var/lib/openapp/./cache/../registry");
    env::set_var("OPENAPP_INSTANCE_NAMESPACE", "apps");
    env::set_var("OPENAPP_SYSTEM_NAMESPACE", "apps-system");
    env::set_var("OPENAPP_SYSTEM_CONFIGMAP", "apps-config");
    env::set_var("OPENAPP_NODE_ADDRESS", "10.1.2.3");
    env::set_var("OPENAPP_SYNC_INTERVAL", "90s");
    env::set_var("OPENAPP_LOG_FORMAT", "json");

    let settings = ControllerSettings::from_env().expect("settings");
    assert_eq!(settings.registry_root, PathBuf::from("/var/lib/openapp/registry"));
    assert_eq!(settings.instance_namespace, "apps");
    assert_eq!(settings.system_namespace, "apps-system");
    assert_eq!(settings.system_configmap, "apps-config");
    assert_eq!(settings.node_address.as_deref(), Some("10.1.2.3"));
    assert_eq!(settings.sync_interval, Duration::from_secs(90));
    assert_eq!(settings.log_format, LogFormat::Json);
}

#[test]
#[serial]
fn blank_values_count_as_unset() {
    let _env = CleanEnv::new();
    env::set_var("OPENAPP_INSTANCE_NAMESPACE", "   ");
    env::set_var("OPENAPP_NODE_ADDRESS", "");
    let settings = ControllerSettings::from_env().expect("settings");
    assert_eq!(settings.instance_namespace, "openapp");
    assert!(settings.node_address.is_none());
}

#[test]
#[serial]
fn invalid_values_are_reported() {
    let _env = CleanEnv::new();
    env::set_var("OPENAPP_SYNC_INTERVAL", "soon");
    let err = ControllerSettings::from_env().expect_err("bad interval");
    assert!(err.to_string().contains("OPENAPP_SYNC_INTERVAL"), "{err}");

    env::set_var("OPENAPP_SYNC_INTERVAL", "0s");
    assert!(ControllerSettings::from_env().is_err());

    env::remove_var("OPENAPP_SYNC_INTERVAL");
    env::set_var("OPENAPP_LOG_FORMAT", "yaml");
    let err = ControllerSettings::from_env().expect_err("bad log format");
    assert!(err.to_string().contains("OPENAPP_LOG_FORMAT"), "{err}");
}
