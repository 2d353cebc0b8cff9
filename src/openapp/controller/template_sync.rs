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

//! Mirrors registry template definitions into AppTemplate and
//! PublicServiceTemplate objects.

use crate::openapp::api::{
    AppTemplate, AppTemplateSpec, PublicServiceTemplate, PublicServiceTemplateSpec,
};
use crate::openapp::controller::watch::WatchEvent;
use crate::openapp::k8s::{Cluster, ClusterError, ObjectClient};
use crate::openapp::logger::{log_debug, log_info, log_warn};
use crate::openapp::observability::metrics::{record_template_sync, OperationOutcome};
use crate::openapp::template::{TemplateKind, TemplateRegistry};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub enum TemplateSyncError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    MissingName {
        path: PathBuf,
    },
    /// Upserts that failed during a scan, as `(template, error)` pairs.
    Upsert(Vec<(String, ClusterError)>),
}

impl Display for TemplateSyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSyncError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            TemplateSyncError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            TemplateSyncError::MissingName { path } => {
                write!(f, "template {} has no metadata.name", path.display())
            }
            TemplateSyncError::Upsert(failures) => {
                write!(f, "{} template(s) failed to sync:", failures.len())?;
                for (name, err) in failures {
                    write!(f, " {} ({})", name, err)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for TemplateSyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TemplateSyncError::Read { source, .. } => Some(source),
            TemplateSyncError::Parse { source, .. } => Some(source),
            TemplateSyncError::MissingName { .. } => None,
            TemplateSyncError::Upsert(failures) => failures
                .first()
                .map(|(_, err)| err as &(dyn Error + 'static)),
        }
    }
}

/// Template kinds synchronised from the registry.
pub trait TemplateResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Send + Sync + 'static
{
    const TEMPLATE_KIND: TemplateKind;
    type Spec: Clone + PartialEq + Send + Sync;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>>;

    fn spec(&self) -> &Self::Spec;

    fn spec_mut(&mut self) -> &mut Self::Spec;
}

impl TemplateResource for AppTemplate {
    const TEMPLATE_KIND: TemplateKind = TemplateKind::App;
    type Spec = AppTemplateSpec;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>> {
        Arc::clone(&cluster.app_templates)
    }

    fn spec(&self) -> &AppTemplateSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut AppTemplateSpec {
        &mut self.spec
    }
}

impl TemplateResource for PublicServiceTemplate {
    const TEMPLATE_KIND: TemplateKind = TemplateKind::PublicService;
    type Spec = PublicServiceTemplateSpec;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>> {
        Arc::clone(&cluster.public_service_templates)
    }

    fn spec(&self) -> &PublicServiceTemplateSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut PublicServiceTemplateSpec {
        &mut self.spec
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

enum Upserted {
    Created,
    Updated,
    Unchanged,
}

/// Reads one `template.yaml`.
pub fn read_template<T: TemplateResource>(path: &Path) -> Result<T, TemplateSyncError> {
    let content = fs::read_to_string(path).map_err(|source| TemplateSyncError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut template: T =
        serde_yaml::from_str(&content).map_err(|source| TemplateSyncError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if template.meta().name.as_deref().map_or(true, str::is_empty) {
        return Err(TemplateSyncError::MissingName {
            path: path.to_path_buf(),
        });
    }
    let meta = template.meta_mut();
    meta.namespace = None;
    meta.resource_version = None;
    meta.uid = None;
    Ok(template)
}

/// The system ConfigMap changing in any way (including the registry
/// refresh stamp) triggers a sync.
pub fn is_sync_trigger(event: &WatchEvent<ConfigMap>, namespace: &str, name: &str) -> bool {
    let config_map = match event {
        WatchEvent::Added(config_map) => config_map,
        WatchEvent::Updated { new, .. } => new,
        WatchEvent::Deleted(_) => return false,
    };
    config_map.metadata.namespace.as_deref() == Some(namespace)
        && config_map.metadata.name.as_deref() == Some(name)
}

pub struct TemplateSyncController<T> {
    name: &'static str,
    client: Arc<dyn ObjectClient<T>>,
    registry: TemplateRegistry,
}

impl<T: TemplateResource> TemplateSyncController<T> {
    pub fn new(name: &'static str, cluster: &Cluster, registry: TemplateRegistry) -> Self {
        Self {
            name,
            client: T::client(cluster),
            registry,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Scans every registry checkout and upserts each template. A template
    /// defined by several registries is taken from the first one. Unreadable
    /// files are skipped; failed upserts are collected and returned together
    /// after the scan so the caller can retry.
    pub async fn sync(&self) -> Result<SyncSummary, TemplateSyncError> {
        let kind = T::kind(&()).to_string();
        let mut summary = SyncSummary::default();
        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for path in self.registry.template_files(T::TEMPLATE_KIND) {
            let template = match read_template::<T>(&path) {
                Ok(template) => template,
                Err(err) => {
                    let error_text = err.to_string();
                    log_warn(
                        self.name,
                        "Skipping unreadable template",
                        &[("kind", kind.as_str()), ("error", error_text.as_str())],
                    );
                    summary.skipped += 1;
                    continue;
                }
            };
            let name = template.name_any();
            if !seen.insert(name.clone()) {
                let path_text = path.display().to_string();
                log_debug(
                    self.name,
                    "Template already provided by an earlier registry",
                    &[("template", name.as_str()), ("path", path_text.as_str())],
                );
                continue;
            }
            match self.upsert(template).await {
                Ok(Upserted::Created) => summary.created += 1,
                Ok(Upserted::Updated) => summary.updated += 1,
                Ok(Upserted::Unchanged) => summary.unchanged += 1,
                Err(err) => failures.push((name, err)),
            }
        }

        if !failures.is_empty() {
            record_template_sync(&kind, OperationOutcome::Error);
            return Err(TemplateSyncError::Upsert(failures));
        }
        record_template_sync(&kind, OperationOutcome::Success);

        let created = summary.created.to_string();
        let updated = summary.updated.to_string();
        let skipped = summary.skipped.to_string();
        log_info(
            self.name,
            "Synchronised templates from registry",
            &[
                ("kind", kind.as_str()),
                ("created", created.as_str()),
                ("updated", updated.as_str()),
                ("skipped", skipped.as_str()),
            ],
        );
        Ok(summary)
    }

    async fn upsert(&self, template: T) -> Result<Upserted, ClusterError> {
        let name = template.name_any();
        let Some(mut existing) = self.client.get(None, &name).await? else {
            self.client.create(None, &template).await?;
            return Ok(Upserted::Created);
        };
        if existing.spec() == template.spec() {
            return Ok(Upserted::Unchanged);
        }
        *existing.spec_mut() = template.spec().clone();
        self.client.replace(None, &name, &existing).await?;
        Ok(Upserted::Updated)
    }
}
