/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::openapp::logger::LogFormat;
use crate::openapp::util::error::with_context;
use std::env;
use std::error::Error;
use std::path::{Component, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_QUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy)]
pub enum Config {
    RegistryCache,
    InstanceNamespace,
    SystemNamespace,
    SystemConfigMap,
    NodeAddress,
    SyncInterval,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::RegistryCache => "OPENAPP_REGISTRY_CACHE",
            Config::InstanceNamespace => "OPENAPP_INSTANCE_NAMESPACE",
            Config::SystemNamespace => "OPENAPP_SYSTEM_NAMESPACE",
            Config::SystemConfigMap => "OPENAPP_SYSTEM_CONFIGMAP",
            Config::NodeAddress => "OPENAPP_NODE_ADDRESS",
            Config::SyncInterval => "OPENAPP_SYNC_INTERVAL",
            Config::LogFormat => "OPENAPP_LOG_FORMAT",
        }
    }

    /// Returns the value used when the environment variable is absent.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::RegistryCache => {
                #[cfg(test)]
                {
                    Some("/tmp/openapp-test/registry")
                }
                #[cfg(not(test))]
                {
                    Some("/root/openapp/registry")
                }
            }
            Config::InstanceNamespace => Some("openapp"),
            Config::SystemNamespace => Some("openapp-system"),
            Config::SystemConfigMap => Some("openapp-config"),
            Config::NodeAddress => None,
            Config::SyncInterval => Some("30m"),
            Config::LogFormat => Some("text"),
        }
    }

    /// Returns the effective value, either from environment or default.
    /// Blank environment values count as unset.
    pub fn get(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.default_value().map(str::to_string))
    }

    /// Returns the effective value as a normalized absolute path.
    pub fn get_path(&self) -> PathBuf {
        Self::normalize_path(&self.get().unwrap_or_default())
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Label and annotation keys stamped on derived objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelKeys {
    pub app_instance: String,
    pub publicservice_instance: String,
    pub expose_class: String,
    pub instance_generation: String,
    pub registry_update_time: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            app_instance: "app.openapp.dev/app-instance".to_string(),
            publicservice_instance: "service.openapp.dev/publicservice-instance".to_string(),
            expose_class: "service.openapp.dev/expose-class".to_string(),
            instance_generation: "instance.openapp.dev/instance-generation".to_string(),
            registry_update_time: "registry.openapp.dev/update-time".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizerNames {
    pub app_instance: String,
    pub publicservice_instance: String,
}

impl Default for FinalizerNames {
    fn default() -> Self {
        Self {
            app_instance: "app-instance-controller".to_string(),
            publicservice_instance: "publicservice-instance-controller".to_string(),
        }
    }
}

/// Immutable settings shared by every controller. Built once at startup and
/// handed to each controller as an `Arc`.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub registry_root: PathBuf,
    pub instance_namespace: String,
    pub system_namespace: String,
    pub system_configmap: String,
    pub registry_key: String,
    pub node_address: Option<String>,
    pub sync_interval: Duration,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub log_format: LogFormat,
    pub labels: LabelKeys,
    pub finalizers: FinalizerNames,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            registry_root: Config::RegistryCache.get_path(),
            instance_namespace: "openapp".to_string(),
            system_namespace: "openapp-system".to_string(),
            system_configmap: "openapp-config".to_string(),
            registry_key: "registry".to_string(),
            node_address: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            queue_base_delay: DEFAULT_QUEUE_BASE_DELAY,
            queue_max_delay: DEFAULT_QUEUE_MAX_DELAY,
            log_format: LogFormat::Text,
            labels: LabelKeys::default(),
            finalizers: FinalizerNames::default(),
        }
    }
}

impl ControllerSettings {
    /// Reads every [`Config`] parameter from the environment.
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let sync_interval = match Config::SyncInterval.get() {
            Some(raw) => humantime::parse_duration(&raw).map_err(|err| {
                with_context(
                    err,
                    format!("invalid {} value '{}'", Config::SyncInterval.env_var(), raw),
                )
            })?,
            None => DEFAULT_SYNC_INTERVAL,
        };
        if sync_interval.is_zero() {
            return Err(format!("{} must be greater than zero", Config::SyncInterval.env_var()).into());
        }

        let log_format = match Config::LogFormat.get() {
            Some(raw) => raw.parse::<LogFormat>().map_err(|err| {
                with_context(err, format!("invalid {}", Config::LogFormat.env_var()))
            })?,
            None => LogFormat::Text,
        };

        let defaults = ControllerSettings::default();
        Ok(Self {
            registry_root: Config::RegistryCache.get_path(),
            instance_namespace: Config::InstanceNamespace
                .get()
                .unwrap_or(defaults.instance_namespace),
            system_namespace: Config::SystemNamespace
                .get()
                .unwrap_or(defaults.system_namespace),
            system_configmap: Config::SystemConfigMap
                .get()
                .unwrap_or(defaults.system_configmap),
            node_address: Config::NodeAddress.get(),
            sync_interval,
            log_format,
            ..defaults
        })
    }
}
