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

//! Keeps the on-disk registry checkouts current and announces each refresh
//! by stamping the system ConfigMap.

use crate::openapp::config::ControllerSettings;
use crate::openapp::controller::watch::WatchEvent;
use crate::openapp::k8s::{ClusterError, ObjectClient};
use crate::openapp::logger::{log_info, log_warn};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

const COMPONENT: &str = "registry-controller";
const DEFAULT_BRANCH: &str = "main";

#[derive(Debug)]
pub enum RegistryError {
    Io {
        context: String,
        source: std::io::Error,
    },
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    Cluster(ClusterError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Io { context, source } => write!(f, "{}: {}", context, source),
            RegistryError::Command {
                command,
                code,
                stderr,
            } => write!(
                f,
                "`{}` failed (exit code {:?}): {}",
                command,
                code,
                stderr.trim()
            ),
            RegistryError::Cluster(err) => write!(f, "{}", err),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegistryError::Io { source, .. } => Some(source),
            RegistryError::Command { .. } => None,
            RegistryError::Cluster(err) => Some(err),
        }
    }
}

impl From<ClusterError> for RegistryError {
    fn from(err: ClusterError) -> Self {
        RegistryError::Cluster(err)
    }
}

/// One `url[@branch]` entry of the registry list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySpec {
    pub url: String,
    pub branch: String,
}

impl RegistrySpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        // `git@host:org/repo` style URLs carry an '@' that is not a branch.
        let (url, branch) = match raw.rsplit_once('@') {
            Some((url, branch))
                if !url.is_empty() && !branch.is_empty() && !branch.contains([':', '/']) =>
            {
                (url, branch)
            }
            _ => (raw, DEFAULT_BRANCH),
        };
        Some(Self {
            url: url.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Checkout directory name: the last path segment without `.git`.
    pub fn checkout_dir(&self) -> String {
        let segment = self
            .url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default();
        segment.trim_end_matches(".git").to_string()
    }
}

/// Parses the comma-separated registry list stored in the system ConfigMap.
pub fn parse_registries(raw: &str) -> Vec<RegistrySpec> {
    raw.split(',').filter_map(RegistrySpec::parse).collect()
}

/// Fetches registry content into a local checkout.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn refresh(&self, spec: &RegistrySpec, checkout: &Path) -> Result<(), RegistryError>;
}

/// Clones on first use, then force-updates the checkout to the remote branch.
#[derive(Clone, Debug, Default)]
pub struct GitRegistrySource;

async fn run_git(args: &[&str]) -> Result<(), RegistryError> {
    let command = format!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|source| RegistryError::Io {
            context: format!("failed to run {}", command),
            source,
        })?;
    if !output.status.success() {
        return Err(RegistryError::Command {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[async_trait]
impl RegistrySource for GitRegistrySource {
    async fn refresh(&self, spec: &RegistrySpec, checkout: &Path) -> Result<(), RegistryError> {
        let dir = checkout.to_string_lossy();
        if checkout.join(".git").is_dir() {
            run_git(&["-C", &dir, "fetch", "--depth", "1", "origin", &spec.branch]).await?;
            return run_git(&["-C", &dir, "reset", "--hard", "FETCH_HEAD"]).await;
        }
        run_git(&[
            "clone",
            "--depth",
            "1",
            "--branch",
            &spec.branch,
            &spec.url,
            &dir,
        ])
        .await
    }
}

/// Registry data changes, not annotation stamps, trigger a refresh.
pub fn is_refresh_trigger(event: &WatchEvent<ConfigMap>, namespace: &str, name: &str) -> bool {
    let config_map = match event {
        WatchEvent::Added(config_map) => config_map,
        WatchEvent::Updated { old, new } if old.data != new.data => new,
        WatchEvent::Updated { .. } | WatchEvent::Deleted(_) => return false,
    };
    config_map.metadata.namespace.as_deref() == Some(namespace)
        && config_map.metadata.name.as_deref() == Some(name)
}

pub struct RegistryController {
    config_maps: Arc<dyn ObjectClient<ConfigMap>>,
    source: Arc<dyn RegistrySource>,
    settings: Arc<ControllerSettings>,
}

impl RegistryController {
    pub fn new(
        config_maps: Arc<dyn ObjectClient<ConfigMap>>,
        source: Arc<dyn RegistrySource>,
        settings: Arc<ControllerSettings>,
    ) -> Self {
        Self {
            config_maps,
            source,
            settings,
        }
    }

    fn checkout_path(&self, spec: &RegistrySpec) -> PathBuf {
        self.settings.registry_root.join(spec.checkout_dir())
    }

    /// Refreshes every configured registry, then stamps the update time on
    /// the system ConfigMap. Nothing is stamped if any registry failed.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let namespace = self.settings.system_namespace.as_str();
        let name = self.settings.system_configmap.as_str();
        let Some(mut config_map) = self.config_maps.get(Some(namespace), name).await? else {
            log_info(
                COMPONENT,
                "System ConfigMap not found; skipping registry refresh",
                &[("namespace", namespace), ("name", name)],
            );
            return Ok(());
        };

        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(&self.settings.registry_key))
            .cloned()
            .unwrap_or_default();
        tokio::fs::create_dir_all(&self.settings.registry_root)
            .await
            .map_err(|source| RegistryError::Io {
                context: format!(
                    "failed to create registry cache {}",
                    self.settings.registry_root.display()
                ),
                source,
            })?;

        let mut first_error = None;
        for spec in parse_registries(&raw) {
            let checkout = self.checkout_path(&spec);
            match self.source.refresh(&spec, &checkout).await {
                Ok(()) => log_info(
                    COMPONENT,
                    "Refreshed registry",
                    &[("url", spec.url.as_str()), ("branch", spec.branch.as_str())],
                ),
                Err(err) => {
                    let error_text = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Failed to refresh registry",
                        &[("url", spec.url.as_str()), ("error", error_text.as_str())],
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        config_map
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(self.settings.labels.registry_update_time.clone(), stamp);
        self.config_maps
            .replace(Some(namespace), name, &config_map)
            .await?;
        Ok(())
    }
}
