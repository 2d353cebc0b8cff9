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

//! Turns rendered manifests into cluster objects owned by an instance.
//!
//! Every object is recorded in the caller's [`DerivedResourceSet`] before the
//! API call that creates or updates it, so an interrupted reconcile still
//! leaves enough bookkeeping behind for cleanup.

use crate::openapp::api::{DerivedResource, DerivedResourceSet};
use crate::openapp::k8s::ownership::{is_terminating, label_value, merge_labels};
use crate::openapp::k8s::{Cluster, ClusterError};
use crate::openapp::logger::{log_info, log_warn};
use crate::openapp::observability::metrics::{
    record_derived_operation, DerivedOperation, OperationOutcome,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceSpec};
use kube::Resource;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

const COMPONENT: &str = "materializer";

#[derive(Debug)]
pub enum MaterializeError {
    /// The rendered text is not a decodable object of its declared kind.
    Decode(String),
    MissingName { kind: String },
    /// The object is still being removed; retry later.
    PendingDeletion { kind: String, name: String },
    Cluster(ClusterError),
}

impl Display for MaterializeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::Decode(msg) => write!(f, "failed to decode manifest: {}", msg),
            MaterializeError::MissingName { kind } => {
                write!(f, "{} manifest has no metadata.name", kind)
            }
            MaterializeError::PendingDeletion { kind, name } => {
                write!(f, "{} '{}' is still being deleted", kind, name)
            }
            MaterializeError::Cluster(err) => write!(f, "{}", err),
        }
    }
}

impl Error for MaterializeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MaterializeError::Cluster(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ClusterError> for MaterializeError {
    fn from(err: ClusterError) -> Self {
        MaterializeError::Cluster(err)
    }
}

impl MaterializeError {
    /// Errors caused by the template or inputs; retrying cannot fix them.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            MaterializeError::Decode(_) | MaterializeError::MissingName { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub enum DecodedManifest {
    Service(Service),
    ConfigMap(ConfigMap),
    StatefulSet(StatefulSet),
    Unsupported { api_version: String, kind: String },
}

pub fn decode_manifest(rendered: &str) -> Result<DecodedManifest, MaterializeError> {
    let document: Value =
        serde_yaml::from_str(rendered).map_err(|err| MaterializeError::Decode(err.to_string()))?;
    let text_field = |field: &str| {
        document
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let kind = text_field("kind");
    let api_version = text_field("apiVersion");

    let decode_err = |err: serde_json::Error| MaterializeError::Decode(format!("{}: {}", kind, err));
    let decoded = match kind.as_str() {
        "Service" => DecodedManifest::Service(serde_json::from_value(document.clone()).map_err(decode_err)?),
        "ConfigMap" => {
            DecodedManifest::ConfigMap(serde_json::from_value(document.clone()).map_err(decode_err)?)
        }
        "StatefulSet" => {
            DecodedManifest::StatefulSet(serde_json::from_value(document.clone()).map_err(decode_err)?)
        }
        "" => return Err(MaterializeError::Decode("manifest has no kind".to_string())),
        _ => DecodedManifest::Unsupported {
            api_version,
            kind: kind.clone(),
        },
    };
    Ok(decoded)
}

fn derived_entry<K>(object: &K) -> Result<DerivedResource, MaterializeError>
where
    K: Resource + k8s_openapi::Resource,
{
    let name = object
        .meta()
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| MaterializeError::MissingName {
            kind: K::KIND.to_string(),
        })?;
    Ok(DerivedResource::new(K::API_VERSION, K::KIND, name))
}

fn tolerate_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

fn counted<T>(
    kind: &str,
    operation: DerivedOperation,
    result: Result<T, ClusterError>,
) -> Result<T, ClusterError> {
    record_derived_operation(kind, operation, OperationOutcome::of(&result));
    result
}

/// Ownership labels stamped on derived objects. Labels added with
/// [`OwnershipLabels::for_kind`] only land on objects of that kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipLabels {
    common: BTreeMap<String, String>,
    by_kind: BTreeMap<String, BTreeMap<String, String>>,
}

impl OwnershipLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.common.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_for_kind(mut self, kind: &str, key: &str, value: &str) -> Self {
        self.by_kind
            .entry(kind.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Labels for an object of `kind`.
    pub fn for_kind(&self, kind: &str) -> BTreeMap<String, String> {
        let mut labels = self.common.clone();
        if let Some(extra) = self.by_kind.get(kind) {
            labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        labels
    }
}

impl From<BTreeMap<String, String>> for OwnershipLabels {
    fn from(common: BTreeMap<String, String>) -> Self {
        Self {
            common,
            by_kind: BTreeMap::new(),
        }
    }
}

/// Upserts and removes derived objects through the shared [`Cluster`].
#[derive(Clone)]
pub struct Materializer {
    cluster: Cluster,
    generation_label: String,
}

impl Materializer {
    pub fn new(cluster: Cluster, generation_label: impl Into<String>) -> Self {
        Self {
            cluster,
            generation_label: generation_label.into(),
        }
    }

    /// Decodes `rendered`, stamps `labels`, records the object in `derived`
    /// and converges the cluster copy. Objects always land in `namespace`.
    pub async fn apply(
        &self,
        rendered: &str,
        namespace: &str,
        labels: &OwnershipLabels,
        derived: &mut DerivedResourceSet,
    ) -> Result<(), MaterializeError> {
        match decode_manifest(rendered)? {
            DecodedManifest::Service(mut service) => {
                derived.record(derived_entry(&service)?);
                prepare(&mut service, namespace, &labels.for_kind("Service"));
                self.apply_service(service, namespace).await
            }
            DecodedManifest::ConfigMap(mut config_map) => {
                derived.record(derived_entry(&config_map)?);
                prepare(&mut config_map, namespace, &labels.for_kind("ConfigMap"));
                self.apply_config_map(config_map, namespace).await
            }
            DecodedManifest::StatefulSet(mut stateful_set) => {
                derived.record(derived_entry(&stateful_set)?);
                prepare(&mut stateful_set, namespace, &labels.for_kind("StatefulSet"));
                self.apply_stateful_set(stateful_set, namespace).await
            }
            DecodedManifest::Unsupported { api_version, kind } => {
                log_warn(
                    COMPONENT,
                    "Skipping manifest of unsupported kind",
                    &[
                        ("apiVersion", api_version.as_str()),
                        ("kind", kind.as_str()),
                        ("namespace", namespace),
                    ],
                );
                Ok(())
            }
        }
    }

    async fn apply_service(&self, desired: Service, namespace: &str) -> Result<(), MaterializeError> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        let client = &self.cluster.services;
        let Some(existing) = client.get(Some(namespace), &name).await? else {
            counted(
                "Service",
                DerivedOperation::Create,
                client.create(Some(namespace), &desired).await,
            )?;
            return Ok(());
        };

        let mut next = existing.clone();
        let mut spec = desired.spec.unwrap_or_default();
        if let Some(current) = existing.spec.as_ref() {
            keep_assigned_service_fields(&mut spec, current);
        }
        next.spec = Some(spec);
        if let Some(labels) = desired.metadata.labels.as_ref() {
            merge_labels(&mut next, labels);
        }
        if next == existing {
            return Ok(());
        }
        counted(
            "Service",
            DerivedOperation::Update,
            client.replace(Some(namespace), &name, &next).await,
        )?;
        Ok(())
    }

    async fn apply_config_map(
        &self,
        desired: ConfigMap,
        namespace: &str,
    ) -> Result<(), MaterializeError> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        let client = &self.cluster.config_maps;
        let Some(existing) = client.get(Some(namespace), &name).await? else {
            counted(
                "ConfigMap",
                DerivedOperation::Create,
                client.create(Some(namespace), &desired).await,
            )?;
            return Ok(());
        };

        let mut next = existing.clone();
        next.data = desired.data;
        next.binary_data = desired.binary_data;
        if let Some(labels) = desired.metadata.labels.as_ref() {
            merge_labels(&mut next, labels);
        }
        if next == existing {
            return Ok(());
        }
        counted(
            "ConfigMap",
            DerivedOperation::Update,
            client.replace(Some(namespace), &name, &next).await,
        )?;
        Ok(())
    }

    /// Stateful workloads are never updated in place: a changed generation
    /// label deletes and re-creates the object so every replica restarts.
    async fn apply_stateful_set(
        &self,
        desired: StatefulSet,
        namespace: &str,
    ) -> Result<(), MaterializeError> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        let client = &self.cluster.stateful_sets;
        let Some(existing) = client.get(Some(namespace), &name).await? else {
            counted(
                "StatefulSet",
                DerivedOperation::Create,
                client.create(Some(namespace), &desired).await,
            )?;
            return Ok(());
        };

        if label_value(&existing, &self.generation_label)
            == label_value(&desired, &self.generation_label)
        {
            return Ok(());
        }
        if is_terminating(&existing) {
            return Err(MaterializeError::PendingDeletion {
                kind: "StatefulSet".to_string(),
                name,
            });
        }

        let generation = label_value(&desired, &self.generation_label).unwrap_or_default();
        log_info(
            COMPONENT,
            "Recreating stateful workload for new instance generation",
            &[
                ("namespace", namespace),
                ("name", name.as_str()),
                ("generation", generation),
            ],
        );
        counted(
            "StatefulSet",
            DerivedOperation::Recreate,
            tolerate_not_found(client.delete(Some(namespace), &name).await),
        )?;
        match client.create(Some(namespace), &desired).await {
            Err(err) if err.is_already_exists() => Err(MaterializeError::PendingDeletion {
                kind: "StatefulSet".to_string(),
                name,
            }),
            result => {
                counted("StatefulSet", DerivedOperation::Create, result)?;
                Ok(())
            }
        }
    }

    /// Removes one recorded object. Missing objects count as removed.
    pub async fn clean(
        &self,
        entry: &DerivedResource,
        namespace: &str,
    ) -> Result<(), MaterializeError> {
        let result = match entry.kind.as_str() {
            "Service" => self.clean_service(&entry.name, namespace).await,
            "ConfigMap" => tolerate_not_found(
                self.cluster
                    .config_maps
                    .delete(Some(namespace), &entry.name)
                    .await,
            ),
            "StatefulSet" => tolerate_not_found(
                self.cluster
                    .stateful_sets
                    .delete(Some(namespace), &entry.name)
                    .await,
            ),
            other => {
                log_warn(
                    COMPONENT,
                    "Cannot clean derived resource of unsupported kind",
                    &[("kind", other), ("name", entry.name.as_str())],
                );
                return Ok(());
            }
        };
        counted(&entry.kind, DerivedOperation::Delete, result)?;
        Ok(())
    }

    /// Services may carry platform finalizers (load balancer cleanup); they
    /// are stripped first or the delete never completes.
    async fn clean_service(&self, name: &str, namespace: &str) -> Result<(), ClusterError> {
        let client = &self.cluster.services;
        let Some(mut service) = client.get(Some(namespace), name).await? else {
            return Ok(());
        };
        if service
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|list| !list.is_empty())
        {
            service.metadata.finalizers = None;
            match client.replace(Some(namespace), name, &service).await {
                Err(err) if err.is_not_found() => return Ok(()),
                other => {
                    other?;
                }
            }
        }
        tolerate_not_found(client.delete(Some(namespace), name).await)
    }

    /// Every supported object in `namespace` matching `selector`.
    pub async fn find_owned(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<DerivedResourceSet, MaterializeError> {
        let mut owned = DerivedResourceSet::new();
        for config_map in self
            .cluster
            .config_maps
            .list(Some(namespace), Some(selector))
            .await?
        {
            owned.record(derived_entry(&config_map)?);
        }
        for service in self
            .cluster
            .services
            .list(Some(namespace), Some(selector))
            .await?
        {
            owned.record(derived_entry(&service)?);
        }
        for stateful_set in self
            .cluster
            .stateful_sets
            .list(Some(namespace), Some(selector))
            .await?
        {
            owned.record(derived_entry(&stateful_set)?);
        }
        Ok(owned)
    }
}

fn prepare<K: Resource>(object: &mut K, namespace: &str, labels: &BTreeMap<String, String>) {
    object.meta_mut().namespace = Some(namespace.to_string());
    merge_labels(object, labels);
}

fn keep_assigned_service_fields(spec: &mut ServiceSpec, current: &ServiceSpec) {
    if spec.cluster_ip.is_none() {
        spec.cluster_ip = current.cluster_ip.clone();
    }
    if spec.cluster_ips.is_none() {
        spec.cluster_ips = current.cluster_ips.clone();
    }
    if spec.health_check_node_port.is_none() {
        spec.health_check_node_port = current.health_check_node_port;
    }
    let (Some(ports), Some(current_ports)) = (spec.ports.as_mut(), current.ports.as_ref()) else {
        return;
    };
    for port in ports.iter_mut().filter(|port| port.node_port.is_none()) {
        port.node_port = current_ports
            .iter()
            .find(|assigned| assigned.name == port.name && assigned.port == port.port)
            .and_then(|assigned| assigned.node_port);
    }
}
