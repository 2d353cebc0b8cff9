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

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How an instance's service is reached from outside the node.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum ExposeType {
    /// Raw transport-level port mapping.
    #[default]
    Layer4,
    /// HTTP-level routing; URLs are reported with an `http://` scheme.
    Layer7,
}

/// One object created on behalf of an instance.
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct DerivedResource {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl DerivedResource {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Ordered, duplicate-free record of derived objects. Insertion order is kept
/// so cleanup mirrors creation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DerivedResourceSet {
    entries: Vec<DerivedResource>,
}

impl DerivedResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DerivedResource>) -> Self {
        let mut set = Self::new();
        for entry in entries {
            set.record(entry);
        }
        set
    }

    /// Appends `entry` unless an identical record already exists.
    pub fn record(&mut self, entry: DerivedResource) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Entries of `self` followed by the entries of `other` not yet present.
    pub fn union(&self, other: &DerivedResourceSet) -> DerivedResourceSet {
        let mut merged = self.clone();
        for entry in other.iter() {
            merged.record(entry.clone());
        }
        merged
    }

    pub fn contains(&self, entry: &DerivedResource) -> bool {
        self.entries.contains(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedResource> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<DerivedResource> {
        self.entries
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "app.openapp.dev",
    version = "v1alpha1",
    kind = "AppInstance",
    namespaced,
    status = "AppInstanceStatus",
    shortname = "appi",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.appTemplate"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.appReady"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppInstanceSpec {
    /// Name of the PublicServiceInstance this application is exposed through.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_service_class: String,
    pub app_template: String,
    /// Serialized YAML (or JSON) document with user inputs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inputs: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppInstanceStatus {
    #[serde(default)]
    pub app_ready: bool,
    #[serde(
        rename = "externalServiceURL",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub external_service_url: String,
    #[serde(
        rename = "localServiceURL",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub local_service_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_resources: Vec<DerivedResource>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "app.openapp.dev",
    version = "v1alpha1",
    kind = "AppTemplate",
    shortname = "appt"
)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplateSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub url: String,
    /// Default inputs document offered to users.
    #[serde(default)]
    pub inputs: String,
    #[serde(default)]
    pub expose_type: ExposeType,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "service.openapp.dev",
    version = "v1alpha1",
    kind = "PublicServiceInstance",
    namespaced,
    status = "PublicServiceInstanceStatus",
    shortname = "psi",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.publicServiceTemplate"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.publicServiceReady"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PublicServiceInstanceSpec {
    pub public_service_template: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inputs: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicServiceInstanceStatus {
    #[serde(default)]
    pub public_service_ready: bool,
    #[serde(
        rename = "localServiceURL",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub local_service_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_resources: Vec<DerivedResource>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "service.openapp.dev",
    version = "v1alpha1",
    kind = "PublicServiceTemplate",
    shortname = "pst"
)]
#[serde(rename_all = "camelCase")]
pub struct PublicServiceTemplateSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub inputs: String,
    #[serde(default)]
    pub expose_types: Vec<ExposeType>,
}

impl PublicServiceTemplateSpec {
    /// Public services are HTTP-fronted unless the template restricts them
    /// to transport-level exposure only.
    pub fn preferred_expose_type(&self) -> ExposeType {
        if self.expose_types.is_empty() || self.expose_types.contains(&ExposeType::Layer7) {
            ExposeType::Layer7
        } else {
            ExposeType::Layer4
        }
    }
}
