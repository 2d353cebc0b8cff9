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

//! Propagates stateful workload readiness onto the owning instance.

use crate::openapp::api::{AppInstance, PublicServiceInstance};
use crate::openapp::controller::instance::InstanceResource;
use crate::openapp::controller::reconcile::{ReconcileData, Reconciler};
use crate::openapp::controller::watch::{ObjectKey, WatchEvent};
use crate::openapp::k8s::ownership::{label_value, selector_for};
use crate::openapp::k8s::{Cluster, ClusterError, ObjectClient};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Resource;
use std::sync::Arc;

/// Instance kinds carrying a readiness flag.
pub trait ReadinessTarget: InstanceResource {
    fn ready(&self) -> bool;

    fn set_ready(&mut self, ready: bool);
}

impl ReadinessTarget for AppInstance {
    fn ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.app_ready)
    }

    fn set_ready(&mut self, ready: bool) {
        self.status.get_or_insert_with(Default::default).app_ready = ready;
    }
}

impl ReadinessTarget for PublicServiceInstance {
    fn ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.public_service_ready)
    }

    fn set_ready(&mut self, ready: bool) {
        self.status
            .get_or_insert_with(Default::default)
            .public_service_ready = ready;
    }
}

/// Keys of the instances owning the object(s) in `event`, read from the
/// ownership label. A relabelled object reports both owners.
pub fn owner_keys<K: Resource>(event: &WatchEvent<K>, ownership_label: &str) -> Vec<ObjectKey> {
    let objects: Vec<&K> = match event {
        WatchEvent::Added(object) | WatchEvent::Deleted(object) => vec![object],
        WatchEvent::Updated { old, new } => vec![old, new],
    };
    let mut keys: Vec<ObjectKey> = Vec::new();
    for object in objects {
        let Some(owner) = label_value(object, ownership_label).filter(|name| !name.is_empty())
        else {
            continue;
        };
        let key = ObjectKey::new(object.meta().namespace.as_deref(), owner);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

pub fn is_ready(stateful_set: &StatefulSet) -> bool {
    stateful_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .is_some_and(|ready| ready > 0)
}

pub struct ReadinessController<I> {
    name: &'static str,
    instances: Arc<dyn ObjectClient<I>>,
    stateful_sets: Arc<dyn ObjectClient<StatefulSet>>,
    ownership_label: String,
}

impl<I: ReadinessTarget> ReadinessController<I> {
    pub fn new(name: &'static str, cluster: &Cluster, ownership_label: &str) -> Self {
        Self {
            name,
            instances: I::client(cluster),
            stateful_sets: Arc::clone(&cluster.stateful_sets),
            ownership_label: ownership_label.to_string(),
        }
    }

    pub fn ownership_label(&self) -> &str {
        &self.ownership_label
    }
}

#[async_trait]
impl<I: ReadinessTarget> Reconciler for ReadinessController<I> {
    type Desired = bool;
    type Observed = I;
    type Plan = Option<I>;
    type Error = ClusterError;

    fn kind(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<ReconcileData<bool, I>>, ClusterError> {
        let Some(instance) = self.instances.get(key.namespace(), &key.name).await? else {
            return Ok(None);
        };
        let selector = selector_for(&self.ownership_label, &key.name);
        let ready = self
            .stateful_sets
            .list(key.namespace(), Some(&selector))
            .await?
            .iter()
            .any(is_ready);
        Ok(Some(ReconcileData {
            desired: ready,
            observed: instance,
        }))
    }

    fn diff(&self, _key: &ObjectKey, desired: &bool, observed: &I) -> Result<Option<I>, ClusterError> {
        if observed.ready() == *desired {
            return Ok(None);
        }
        let mut next = observed.clone();
        next.set_ready(*desired);
        Ok(Some(next))
    }

    async fn apply(&self, key: &ObjectKey, plan: Option<I>) -> Result<(), ClusterError> {
        let Some(instance) = plan else {
            return Ok(());
        };
        match self
            .instances
            .replace_status(key.namespace(), &key.name, &instance)
            .await
        {
            Err(err) if err.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapp::k8s::memory::{InMemoryCluster, Verb};
    use crate::openapp::test_support::{app_instance, TEST_NAMESPACE};
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const LABEL: &str = "app.openapp.dev/app-instance";

    fn stateful_set(owner: &str, ready_replicas: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(owner.to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([(LABEL.to_string(), owner.to_string())])),
                ..Default::default()
            },
            status: Some(StatefulSetStatus {
                ready_replicas: Some(ready_replicas),
                replicas: 1,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some(TEST_NAMESPACE), name)
    }

    #[test]
    fn relabelled_object_reports_both_owners() {
        let old = stateful_set("a", 0);
        let mut new = old.clone();
        new.metadata.labels = Some(BTreeMap::from([(LABEL.to_string(), "b".to_string())]));
        assert_eq!(
            owner_keys(&WatchEvent::Updated { old, new }, LABEL),
            vec![key("a"), key("b")]
        );
        let mut unlabelled = stateful_set("c", 0);
        unlabelled.metadata.labels = None;
        assert!(owner_keys(&WatchEvent::Added(unlabelled), LABEL).is_empty());
    }

    #[tokio::test]
    async fn readiness_follows_ready_replicas() {
        let memory = InMemoryCluster::new();
        memory.app_instances.seed(app_instance("demo", "web", ""));
        memory.stateful_sets.seed(stateful_set("demo", 1));
        let controller = ReadinessController::<AppInstance>::new("status", &memory.cluster(), LABEL);

        controller.reconcile_and_apply(&key("demo")).await.expect("reconcile");
        let stored = memory
            .app_instances
            .snapshot(Some(TEST_NAMESPACE), "demo")
            .expect("instance");
        assert!(stored.ready());

        memory.journal().clear();
        controller.reconcile_and_apply(&key("demo")).await.expect("again");
        assert!(memory.journal().names(Verb::ReplaceStatus).is_empty());
    }

    #[tokio::test]
    async fn missing_instance_is_never_written() {
        let memory = InMemoryCluster::new();
        memory.stateful_sets.seed(stateful_set("ghost", 1));
        let controller = ReadinessController::<AppInstance>::new("status", &memory.cluster(), LABEL);
        controller
            .reconcile_and_apply(&key("ghost"))
            .await
            .expect("not found is a no-op");
        assert!(memory.journal().entries().is_empty());
    }
}
