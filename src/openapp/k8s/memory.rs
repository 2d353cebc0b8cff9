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

//! Process-local object store implementing [`ObjectClient`]. It follows the
//! API server semantics the controllers depend on: resource versions with
//! optimistic concurrency, generation bumps on content changes, finalizer
//! gated deletion and list-then-watch streams. Every successful write is
//! appended to a shared [`Journal`] so tests can assert on ordering.

use super::client::{Cluster, ObjectClient};
use super::ownership::selector_matches;
use super::{ClusterError, ObjectEvent};
use crate::openapp::api::{
    AppInstance, AppTemplate, PublicServiceInstance, PublicServiceTemplate,
};
use crate::openapp::util::error::new_error;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const WATCH_BUFFER_SIZE: usize = 256;
const DEFAULT_NAMESPACE: &str = "default";
const CONFLICT_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// Ordered record of writes across every kind in an [`InMemoryCluster`].
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, verb: Verb, kind: &str, namespace: Option<&str>, name: &str) {
        self.lock().push(JournalEntry {
            verb,
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().clone()
    }

    /// Entries matching `verb`, rendered as `Kind/name`.
    pub fn names(&self, verb: Verb) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|entry| entry.verb == verb)
            .map(|entry| format!("{}/{}", entry.kind, entry.name))
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

type StoreKey = (Option<String>, String);

struct Store<K> {
    objects: BTreeMap<StoreKey, K>,
    failures: Vec<(Verb, String)>,
}

pub struct InMemoryObjectClient<K> {
    kind: String,
    namespaced: bool,
    store: Mutex<Store<K>>,
    sender: broadcast::Sender<ObjectEvent<K>>,
    versions: Arc<AtomicU64>,
    journal: Journal,
}

fn without_bookkeeping(value: &Value) -> Value {
    let mut content = value.clone();
    if let Some(map) = content.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    content
}

fn status_of(value: &Value) -> Option<Value> {
    value.get("status").filter(|status| !status.is_null()).cloned()
}

fn set_status(value: &mut Value, status: Option<Value>) {
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

impl<K> InMemoryObjectClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(namespaced: bool, versions: Arc<AtomicU64>, journal: Journal) -> Self {
        let (sender, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            kind: K::kind(&()).to_string(),
            namespaced,
            store: Mutex::new(Store {
                objects: BTreeMap::new(),
                failures: Vec::new(),
            }),
            sender,
            versions,
            journal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store<K>> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scope(&self, namespace: Option<&str>) -> Option<String> {
        self.namespaced.then(|| {
            namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or(DEFAULT_NAMESPACE)
                .to_string()
        })
    }

    fn next_version(&self) -> String {
        self.versions.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn not_found(&self, name: &str) -> ClusterError {
        ClusterError::NotFound {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    fn take_failure(store: &mut Store<K>, kind: &str, verb: Verb, name: &str) -> Result<(), ClusterError> {
        if let Some(index) = store
            .failures
            .iter()
            .position(|(v, n)| *v == verb && n == name)
        {
            store.failures.remove(index);
            return Err(ClusterError::Api(new_error(format!(
                "injected {:?} failure for {} '{}'",
                verb, kind, name
            ))));
        }
        Ok(())
    }

    fn check_version(existing: &K, incoming: &K) -> Result<(), ClusterError> {
        match incoming.meta().resource_version.as_deref() {
            Some(version) if existing.meta().resource_version.as_deref() != Some(version) => {
                Err(ClusterError::Conflict(CONFLICT_MESSAGE.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn publish(&self, event: ObjectEvent<K>) {
        let _ = self.sender.send(event);
    }

    /// Makes the next `verb` against `name` fail with an API error.
    pub fn inject_failure(&self, verb: Verb, name: &str) {
        self.lock().failures.push((verb, name.to_string()));
    }

    /// Stores `object` as-is, status included, bypassing the journal.
    pub fn seed(&self, mut object: K) -> K {
        let key = (
            self.scope(object.meta().namespace.as_deref()),
            object.meta().name.clone().unwrap_or_default(),
        );
        {
            let meta = object.meta_mut();
            meta.namespace = key.0.clone();
            meta.resource_version = Some(self.next_version());
            meta.generation = meta.generation.or(Some(1));
            if meta.uid.is_none() {
                meta.uid = Some(format!("uid-{}", key.1));
            }
        }
        self.lock().objects.insert(key, object.clone());
        self.publish(ObjectEvent::Applied(object.clone()));
        object
    }

    pub fn snapshot(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = (self.scope(namespace), name.to_string());
        self.lock().objects.get(&key).cloned()
    }

    pub fn all(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<K> ObjectClient<K> for InMemoryObjectClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClusterError> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError> {
        let scope = namespace.and_then(|ns| self.scope(Some(ns)));
        let store = self.lock();
        Ok(store
            .objects
            .iter()
            .filter(|((ns, _), _)| scope.is_none() || *ns == scope)
            .filter(|(_, object)| {
                selector.map_or(true, |sel| selector_matches(object.meta().labels.as_ref(), sel))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, namespace: Option<&str>, object: &K) -> Result<K, ClusterError> {
        let name = object
            .meta()
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClusterError::Invalid("metadata.name is required".to_string()))?;
        if object.meta().resource_version.is_some() {
            return Err(ClusterError::Invalid(
                "resourceVersion must not be set on create".to_string(),
            ));
        }
        let scope = self.scope(object.meta().namespace.as_deref().or(namespace));
        let key = (scope.clone(), name.clone());

        let mut value = serde_json::to_value(object)?;
        set_status(&mut value, None);
        let mut stored: K = serde_json::from_value(value)?;
        {
            let meta = stored.meta_mut();
            meta.namespace = scope.clone();
            meta.resource_version = Some(self.next_version());
            meta.generation = Some(1);
            meta.uid = Some(format!("uid-{}-{}", name, self.versions.load(Ordering::SeqCst)));
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
        }

        {
            let mut store = self.lock();
            Self::take_failure(&mut store, &self.kind, Verb::Create, &name)?;
            if store.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists {
                    kind: self.kind.clone(),
                    name,
                });
            }
            store.objects.insert(key, stored.clone());
        }

        self.journal
            .record(Verb::Create, &self.kind, scope.as_deref(), &name);
        self.publish(ObjectEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let key = (self.scope(namespace), name.to_string());
        let (stored, removed) = {
            let mut store = self.lock();
            Self::take_failure(&mut store, &self.kind, Verb::Replace, name)?;
            let existing = store
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| self.not_found(name))?;
            Self::check_version(&existing, object)?;

            let existing_value = serde_json::to_value(&existing)?;
            let mut value = serde_json::to_value(object)?;
            set_status(&mut value, status_of(&existing_value));
            let content_changed =
                without_bookkeeping(&existing_value) != without_bookkeeping(&value);
            let mut next: K = serde_json::from_value(value)?;
            {
                let previous = existing.meta();
                let generation = previous.generation.unwrap_or(1);
                let meta = next.meta_mut();
                meta.name = Some(name.to_string());
                meta.namespace = key.0.clone();
                meta.uid = previous.uid.clone();
                meta.creation_timestamp = previous.creation_timestamp.clone();
                meta.deletion_timestamp = previous.deletion_timestamp.clone();
                meta.resource_version = previous.resource_version.clone();
                meta.generation = Some(if content_changed {
                    generation + 1
                } else {
                    generation
                });
            }
            if serde_json::to_value(&next)? == existing_value {
                return Ok(existing);
            }
            next.meta_mut().resource_version = Some(self.next_version());

            let finalizers_empty = next
                .meta()
                .finalizers
                .as_ref()
                .map_or(true, |list| list.is_empty());
            if next.meta().deletion_timestamp.is_some() && finalizers_empty {
                store.objects.remove(&key);
                (next, true)
            } else {
                store.objects.insert(key.clone(), next.clone());
                (next, false)
            }
        };

        self.journal
            .record(Verb::Replace, &self.kind, key.0.as_deref(), name);
        if removed {
            self.publish(ObjectEvent::Deleted(stored.clone()));
        } else {
            self.publish(ObjectEvent::Applied(stored.clone()));
        }
        Ok(stored)
    }

    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let key = (self.scope(namespace), name.to_string());
        let stored = {
            let mut store = self.lock();
            Self::take_failure(&mut store, &self.kind, Verb::ReplaceStatus, name)?;
            let existing = store
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| self.not_found(name))?;
            Self::check_version(&existing, object)?;

            let incoming = serde_json::to_value(object)?;
            let existing_value = serde_json::to_value(&existing)?;
            if status_of(&incoming) == status_of(&existing_value) {
                return Ok(existing);
            }
            let mut value = existing_value;
            set_status(&mut value, status_of(&incoming));
            let mut next: K = serde_json::from_value(value)?;
            next.meta_mut().resource_version = Some(self.next_version());
            store.objects.insert(key.clone(), next.clone());
            next
        };

        self.journal
            .record(Verb::ReplaceStatus, &self.kind, key.0.as_deref(), name);
        self.publish(ObjectEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let key = (self.scope(namespace), name.to_string());
        let event = {
            let mut store = self.lock();
            Self::take_failure(&mut store, &self.kind, Verb::Delete, name)?;
            let existing = store
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| self.not_found(name))?;

            let has_finalizers = existing
                .meta()
                .finalizers
                .as_ref()
                .is_some_and(|list| !list.is_empty());
            if has_finalizers {
                if existing.meta().deletion_timestamp.is_some() {
                    return Ok(());
                }
                let mut next = existing;
                let meta = next.meta_mut();
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.generation = Some(meta.generation.unwrap_or(1) + 1);
                meta.resource_version = Some(self.next_version());
                store.objects.insert(key.clone(), next.clone());
                ObjectEvent::Applied(next)
            } else {
                store.objects.remove(&key);
                ObjectEvent::Deleted(existing)
            }
        };

        self.journal
            .record(Verb::Delete, &self.kind, key.0.as_deref(), name);
        self.publish(event);
        Ok(())
    }

    fn watch(
        &self,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<ObjectEvent<K>, ClusterError>> {
        let scope = namespace.and_then(|ns| self.scope(Some(ns)));
        let (receiver, snapshot) = {
            let store = self.lock();
            let receiver = self.sender.subscribe();
            let snapshot: Vec<K> = store
                .objects
                .iter()
                .filter(|((ns, _), _)| scope.is_none() || *ns == scope)
                .map(|(_, object)| object.clone())
                .collect();
            (receiver, snapshot)
        };

        let initial = std::iter::once(ObjectEvent::InitStarted)
            .chain(snapshot.into_iter().map(ObjectEvent::InitApplied))
            .chain(std::iter::once(ObjectEvent::InitDone))
            .map(Ok)
            .collect::<Vec<_>>();

        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = item.ok().filter(|event| match (&scope, event) {
                (None, _) => true,
                (Some(ns), ObjectEvent::Applied(object) | ObjectEvent::Deleted(object)) => {
                    object.meta().namespace.as_deref() == Some(ns.as_str())
                }
                _ => true,
            });
            future::ready(event.map(Ok))
        });

        stream::iter(initial).chain(live).boxed()
    }
}

/// A full [`Cluster`] kept in memory.
#[derive(Clone)]
pub struct InMemoryCluster {
    pub services: Arc<InMemoryObjectClient<Service>>,
    pub config_maps: Arc<InMemoryObjectClient<ConfigMap>>,
    pub stateful_sets: Arc<InMemoryObjectClient<StatefulSet>>,
    pub app_instances: Arc<InMemoryObjectClient<AppInstance>>,
    pub app_templates: Arc<InMemoryObjectClient<AppTemplate>>,
    pub public_service_instances: Arc<InMemoryObjectClient<PublicServiceInstance>>,
    pub public_service_templates: Arc<InMemoryObjectClient<PublicServiceTemplate>>,
    journal: Journal,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let versions = Arc::new(AtomicU64::new(1));
        let journal = Journal::default();
        Self {
            services: Arc::new(InMemoryObjectClient::new(true, versions.clone(), journal.clone())),
            config_maps: Arc::new(InMemoryObjectClient::new(
                true,
                versions.clone(),
                journal.clone(),
            )),
            stateful_sets: Arc::new(InMemoryObjectClient::new(
                true,
                versions.clone(),
                journal.clone(),
            )),
            app_instances: Arc::new(InMemoryObjectClient::new(
                true,
                versions.clone(),
                journal.clone(),
            )),
            app_templates: Arc::new(InMemoryObjectClient::new(
                false,
                versions.clone(),
                journal.clone(),
            )),
            public_service_instances: Arc::new(InMemoryObjectClient::new(
                true,
                versions.clone(),
                journal.clone(),
            )),
            public_service_templates: Arc::new(InMemoryObjectClient::new(
                false,
                versions,
                journal.clone(),
            )),
            journal,
        }
    }

    pub fn cluster(&self) -> Cluster {
        Cluster {
            services: self.services.clone(),
            config_maps: self.config_maps.clone(),
            stateful_sets: self.stateful_sets.clone(),
            app_instances: self.app_instances.clone(),
            app_templates: self.app_templates.clone(),
            public_service_instances: self.public_service_instances.clone(),
            public_service_templates: self.public_service_templates.clone(),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapp::api::{AppInstanceSpec, AppInstanceStatus};
    use kube::api::ObjectMeta;
    use std::time::Duration;
    use tokio::time::timeout;

    fn instance(name: &str) -> AppInstance {
        let mut object = AppInstance::new(
            name,
            AppInstanceSpec {
                app_template: "web".to_string(),
                ..Default::default()
            },
        );
        object.metadata.namespace = Some("openapp".to_string());
        object
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("openapp".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let cluster = InMemoryCluster::new();
        let created = cluster
            .app_instances
            .create(Some("openapp"), &instance("demo"))
            .await
            .expect("create");

        let mut first = created.clone();
        first.spec.inputs = "a: 1".to_string();
        cluster
            .app_instances
            .replace(Some("openapp"), "demo", &first)
            .await
            .expect("first replace");

        let mut stale = created;
        stale.spec.inputs = "a: 2".to_string();
        let err = cluster
            .app_instances
            .replace(Some("openapp"), "demo", &stale)
            .await
            .expect_err("stale replace must fail");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn generation_tracks_spec_changes_only() {
        let cluster = InMemoryCluster::new();
        let created = cluster
            .app_instances
            .create(Some("openapp"), &instance("demo"))
            .await
            .expect("create");
        assert_eq!(created.metadata.generation, Some(1));

        let mut labelled = created.clone();
        labelled
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("tier".to_string(), "web".to_string());
        let labelled = cluster
            .app_instances
            .replace(Some("openapp"), "demo", &labelled)
            .await
            .expect("label replace");
        assert_eq!(labelled.metadata.generation, Some(1));

        let mut changed = labelled;
        changed.spec.inputs = "replicas: 2".to_string();
        let changed = cluster
            .app_instances
            .replace(Some("openapp"), "demo", &changed)
            .await
            .expect("spec replace");
        assert_eq!(changed.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn replace_keeps_status_and_status_write_keeps_spec() {
        let cluster = InMemoryCluster::new();
        let created = cluster
            .app_instances
            .create(Some("openapp"), &instance("demo"))
            .await
            .expect("create");

        let mut with_status = created.clone();
        with_status.status = Some(AppInstanceStatus {
            app_ready: true,
            ..Default::default()
        });
        with_status.spec.inputs = "ignored: true".to_string();
        let stored = cluster
            .app_instances
            .replace_status(Some("openapp"), "demo", &with_status)
            .await
            .expect("status write");
        assert!(stored.status.as_ref().is_some_and(|s| s.app_ready));
        assert!(stored.spec.inputs.is_empty());

        let mut spec_change = stored.clone();
        spec_change.status = None;
        spec_change.spec.inputs = "x: 1".to_string();
        let stored = cluster
            .app_instances
            .replace(Some("openapp"), "demo", &spec_change)
            .await
            .expect("replace");
        assert!(stored.status.as_ref().is_some_and(|s| s.app_ready));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_removed() {
        let cluster = InMemoryCluster::new();
        let mut object = instance("demo");
        object.metadata.finalizers = Some(vec!["app-instance-controller".to_string()]);
        cluster
            .app_instances
            .create(Some("openapp"), &object)
            .await
            .expect("create");

        cluster
            .app_instances
            .delete(Some("openapp"), "demo")
            .await
            .expect("delete");
        let terminating = cluster
            .app_instances
            .snapshot(Some("openapp"), "demo")
            .expect("still present");
        assert!(terminating.metadata.deletion_timestamp.is_some());
        assert_eq!(terminating.metadata.generation, Some(2));

        let mut released = terminating;
        released.metadata.finalizers = Some(Vec::new());
        cluster
            .app_instances
            .replace(Some("openapp"), "demo", &released)
            .await
            .expect("release");
        assert!(cluster.app_instances.snapshot(Some("openapp"), "demo").is_none());
    }

    #[tokio::test]
    async fn watch_replays_snapshot_then_streams_changes() {
        let cluster = InMemoryCluster::new();
        cluster
            .config_maps
            .create(Some("openapp"), &config_map("existing"))
            .await
            .expect("create");

        let mut events = cluster.config_maps.watch(Some("openapp"));
        assert!(matches!(events.next().await, Some(Ok(ObjectEvent::InitStarted))));
        assert!(matches!(
            events.next().await,
            Some(Ok(ObjectEvent::InitApplied(cm))) if cm.metadata.name.as_deref() == Some("existing")
        ));
        assert!(matches!(events.next().await, Some(Ok(ObjectEvent::InitDone))));

        cluster
            .config_maps
            .delete(Some("openapp"), "existing")
            .await
            .expect("delete");
        let event = timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event in time");
        assert!(matches!(event, Some(Ok(ObjectEvent::Deleted(_)))));
    }

    #[tokio::test]
    async fn injected_failures_fire_once_and_journal_skips_them() {
        let cluster = InMemoryCluster::new();
        cluster.config_maps.inject_failure(Verb::Create, "flaky");
        assert!(cluster
            .config_maps
            .create(Some("openapp"), &config_map("flaky"))
            .await
            .is_err());
        cluster
            .config_maps
            .create(Some("openapp"), &config_map("flaky"))
            .await
            .expect("second attempt succeeds");
        assert_eq!(cluster.journal().names(Verb::Create), vec!["ConfigMap/flaky"]);
    }

    #[tokio::test]
    async fn list_filters_by_selector_and_namespace() {
        let cluster = InMemoryCluster::new();
        let mut labelled = config_map("one");
        labelled.metadata.labels = Some(BTreeMap::from([(
            "app.openapp.dev/app-instance".to_string(),
            "demo".to_string(),
        )]));
        cluster
            .config_maps
            .create(None, &labelled)
            .await
            .expect("create labelled");
        cluster
            .config_maps
            .create(None, &config_map("two"))
            .await
            .expect("create plain");

        let matched = cluster
            .config_maps
            .list(Some("openapp"), Some("app.openapp.dev/app-instance=demo"))
            .await
            .expect("list");
        assert_eq!(matched.len(), 1);
        let other_namespace = cluster
            .config_maps
            .list(Some("elsewhere"), None)
            .await
            .expect("list");
        assert!(other_namespace.is_empty());
    }
}
