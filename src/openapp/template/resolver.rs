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

use crate::openapp::logger::log_warn;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "template-registry";
const TEMPLATE_FILE_NAME: &str = "template.yaml";
const MANIFESTS_DIR_NAME: &str = "manifests";

/// Which family of templates a lookup targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    App,
    PublicService,
}

impl TemplateKind {
    /// Directory holding this family inside a registry checkout.
    pub fn dir_name(self) -> &'static str {
        match self {
            TemplateKind::App => "app-template",
            TemplateKind::PublicService => "publicservice-template",
        }
    }
}

/// Object kind a manifest file produces.
///
/// The declaration order is the materialization order: configuration and
/// network objects exist before the workload that mounts or fronts them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestKind {
    ConfigMap,
    Service,
    Other,
    StatefulSet,
}

impl ManifestKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "ConfigMap" => ManifestKind::ConfigMap,
            "Service" => ManifestKind::Service,
            "StatefulSet" => ManifestKind::StatefulSet,
            _ => ManifestKind::Other,
        }
    }

    /// Kind declared by the first top-level `kind:` line of an unrendered
    /// manifest. Template actions make the file invalid YAML until it is
    /// rendered, so this is a line scan rather than a parse.
    pub fn declared_in(source: &str) -> Option<Self> {
        source.lines().find_map(|line| {
            let value = line.strip_prefix("kind:")?.trim();
            let value = value
                .split_once(" #")
                .map_or(value, |(kind, _)| kind.trim_end())
                .trim_matches(|c: char| c == '"' || c == '\'');
            if value.is_empty() || value.contains("{{") {
                return None;
            }
            Some(Self::from_kind(value))
        })
    }

    /// Fallback for manifests whose kind is itself templated: a
    /// `<anything>statefulset.yaml` style suffix.
    pub fn from_file_name(file_name: &str) -> Self {
        let lowered = file_name.to_ascii_lowercase();
        let stem = lowered
            .strip_suffix(".yaml")
            .or_else(|| lowered.strip_suffix(".yml"))
            .unwrap_or(&lowered);
        if stem.ends_with("statefulset") {
            ManifestKind::StatefulSet
        } else if stem.ends_with("configmap") {
            ManifestKind::ConfigMap
        } else if stem.ends_with("service") {
            ManifestKind::Service
        } else {
            ManifestKind::Other
        }
    }

    fn of_file(path: &Path, file_name: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(source) => Self::declared_in(&source),
            Err(err) => {
                let error_text = err.to_string();
                let path_text = path.display().to_string();
                log_warn(
                    COMPONENT,
                    "Failed to read manifest; ordering by file name",
                    &[("path", path_text.as_str()), ("error", error_text.as_str())],
                );
                None
            }
        }
        .unwrap_or_else(|| Self::from_file_name(file_name))
    }
}

/// One manifest file of a template, in materialization order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestRef {
    pub path: PathBuf,
    pub kind: ManifestKind,
}

impl ManifestRef {
    fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

fn manifest_order(left: &ManifestRef, right: &ManifestRef) -> Ordering {
    left.kind
        .cmp(&right.kind)
        .then_with(|| left.file_name().cmp(right.file_name()))
}

/// Read-only view over the registry cache directory. Each child directory is
/// one registry checkout.
#[derive(Clone, Debug)]
pub struct TemplateRegistry {
    root: PathBuf,
}

impl TemplateRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry checkouts in name order.
    pub fn registry_paths(&self) -> Vec<PathBuf> {
        sorted_entries(&self.root, |path| path.is_dir())
    }

    /// Every `<registry>/<kind-dir>/<name>/template.yaml` across all
    /// registries. Files are not checked for existence; readers report
    /// missing ones.
    pub fn template_files(&self, kind: TemplateKind) -> Vec<PathBuf> {
        self.registry_paths()
            .into_iter()
            .flat_map(|registry| {
                sorted_entries(&registry.join(kind.dir_name()), |path| path.is_dir())
            })
            .map(|template_dir| template_dir.join(TEMPLATE_FILE_NAME))
            .collect()
    }

    /// Manifests of the first registry that defines `name`. An unknown
    /// template resolves to no manifests.
    pub fn find_template_resources(&self, name: &str, kind: TemplateKind) -> Vec<ManifestRef> {
        if name.is_empty() {
            return Vec::new();
        }

        for registry in self.registry_paths() {
            let template_dir = registry.join(kind.dir_name()).join(name);
            if !template_dir.is_dir() {
                continue;
            }

            let mut manifests: Vec<ManifestRef> =
                sorted_entries(&template_dir.join(MANIFESTS_DIR_NAME), |path| path.is_file())
                    .into_iter()
                    .filter_map(|path| {
                        let file_name = path.file_name()?.to_str()?.to_string();
                        if file_name.starts_with('.') {
                            return None;
                        }
                        Some(ManifestRef {
                            kind: ManifestKind::of_file(&path, &file_name),
                            path,
                        })
                    })
                    .collect();
            manifests.sort_by(manifest_order);
            return manifests;
        }

        Vec::new()
    }
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            let error_text = err.to_string();
            let path_text = dir.display().to_string();
            log_warn(
                COMPONENT,
                "Failed to read registry directory",
                &[("path", path_text.as_str()), ("error", error_text.as_str())],
            );
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| keep(path))
        .collect();
    paths.sort();
    paths
}
