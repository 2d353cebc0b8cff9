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

use crate::openapp::api::{AppInstance, DerivedResourceSet, PublicServiceInstance};
use crate::openapp::config::ControllerSettings;
use crate::openapp::controller::instance::{
    InstanceController, InstanceError, InstanceHooks, InstanceResource,
};
use crate::openapp::controller::watch::{ObjectKey, WatchEvent};
use crate::openapp::k8s::{Cluster, ObjectClient};
use crate::openapp::template::render::public_service_values;
use crate::openapp::template::{OwnershipLabels, RenderError, TemplateKind, TemplateRegistry};
use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;

pub const CONTROLLER_NAME: &str = "publicserviceinstance-controller";

pub const DELETION_BLOCKED_MESSAGE: &str =
    "APP instance is using this publicservice instance, cannot be deleted";

pub type PublicServiceInstanceController =
    InstanceController<PublicServiceInstance, PublicServiceInstanceHooks>;

impl InstanceResource for PublicServiceInstance {
    const TEMPLATE_KIND: TemplateKind = TemplateKind::PublicService;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>> {
        Arc::clone(&cluster.public_service_instances)
    }

    fn template_name(&self) -> &str {
        &self.spec.public_service_template
    }

    fn values(&self) -> Result<Value, RenderError> {
        public_service_values(&self.name_any(), &self.spec.inputs)
    }

    fn derived_resources(&self) -> DerivedResourceSet {
        self.status
            .as_ref()
            .map(|status| DerivedResourceSet::from_entries(status.derived_resources.clone()))
            .unwrap_or_default()
    }

    fn status_message(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.message.as_str())
            .unwrap_or_default()
    }

    fn set_derived_status(&mut self, derived: DerivedResourceSet, message: String) {
        let status = self.status.get_or_insert_with(Default::default);
        status.derived_resources = derived.into_entries();
        status.message = message;
    }
}

pub struct PublicServiceInstanceHooks {
    app_instances: Arc<dyn ObjectClient<AppInstance>>,
    settings: Arc<ControllerSettings>,
}

impl PublicServiceInstanceHooks {
    pub fn new(cluster: &Cluster, settings: Arc<ControllerSettings>) -> Self {
        Self {
            app_instances: Arc::clone(&cluster.app_instances),
            settings,
        }
    }
}

#[async_trait]
impl InstanceHooks<PublicServiceInstance> for PublicServiceInstanceHooks {
    fn controller(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn finalizer(&self) -> &str {
        &self.settings.finalizers.publicservice_instance
    }

    fn ownership_label(&self) -> &str {
        &self.settings.labels.publicservice_instance
    }

    fn labels(&self, instance: &PublicServiceInstance) -> OwnershipLabels {
        let labels = &self.settings.labels;
        let generation = instance.metadata.generation.unwrap_or_default().to_string();
        OwnershipLabels::new()
            .with(&labels.publicservice_instance, &instance.name_any())
            .with_for_kind("StatefulSet", &labels.instance_generation, &generation)
    }

    /// A public service stays while any application instance in its
    /// namespace is exposed through it.
    async fn deletion_guard(
        &self,
        instance: &PublicServiceInstance,
    ) -> Result<Option<String>, InstanceError> {
        let name = instance.name_any();
        let referenced = self
            .app_instances
            .list(instance.namespace().as_deref(), None)
            .await?
            .iter()
            .any(|app| app.spec.public_service_class == name);
        Ok(referenced.then(|| DELETION_BLOCKED_MESSAGE.to_string()))
    }
}

pub fn public_service_instance_controller(
    cluster: Cluster,
    settings: Arc<ControllerSettings>,
) -> PublicServiceInstanceController {
    let hooks = PublicServiceInstanceHooks::new(&cluster, Arc::clone(&settings));
    InstanceController::new(
        cluster,
        TemplateRegistry::new(&settings.registry_root),
        &settings.labels.instance_generation,
        hooks,
    )
}

/// Public services an application instance stopped referencing. A blocked
/// deletion is retried once its last reference goes away.
pub fn released_public_services(event: &WatchEvent<AppInstance>) -> Vec<ObjectKey> {
    let released = match event {
        WatchEvent::Added(_) => None,
        WatchEvent::Updated { old, new } => {
            (old.spec.public_service_class != new.spec.public_service_class).then_some(old)
        }
        WatchEvent::Deleted(app) => Some(app),
    };
    released
        .filter(|app| !app.spec.public_service_class.is_empty())
        .map(|app| {
            ObjectKey::new(
                app.metadata.namespace.as_deref(),
                &app.spec.public_service_class,
            )
        })
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapp::controller::reconcile::Reconciler;
    use crate::openapp::k8s::memory::InMemoryCluster;
    use crate::openapp::k8s::ownership::has_finalizer;
    use crate::openapp::test_support::{
        app_instance, public_service_instance, RegistryFixture, SERVICE_MANIFEST,
        STATEFULSET_MANIFEST, TEST_NAMESPACE,
    };

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some(TEST_NAMESPACE), name)
    }

    fn setup() -> (RegistryFixture, InMemoryCluster, PublicServiceInstanceController) {
        let registry = RegistryFixture::new();
        registry
            .public_service_template("gateway", &["Layer7"])
            .manifest("service.yaml", SERVICE_MANIFEST)
            .manifest("statefulset.yaml", STATEFULSET_MANIFEST);
        let memory = InMemoryCluster::new();
        let controller =
            public_service_instance_controller(memory.cluster(), Arc::new(registry.settings()));
        (registry, memory, controller)
    }

    #[tokio::test]
    async fn referenced_instance_cannot_be_deleted() {
        let (_registry, memory, controller) = setup();
        memory
            .public_service_instances
            .seed(public_service_instance("edge", "gateway", "port: 80"));
        controller
            .reconcile_and_apply(&key("edge"))
            .await
            .expect("reconcile");

        let mut app = app_instance("demo", "web", "");
        app.spec.public_service_class = "edge".to_string();
        memory.app_instances.seed(app);
        memory
            .public_service_instances
            .delete(Some(TEST_NAMESPACE), "edge")
            .await
            .expect("delete");

        controller
            .reconcile_and_apply(&key("edge"))
            .await
            .expect("blocked delete is not an error");
        let stored = memory
            .public_service_instances
            .snapshot(Some(TEST_NAMESPACE), "edge")
            .expect("still present");
        assert!(has_finalizer(&stored, "publicservice-instance-controller"));
        assert_eq!(
            stored.status.expect("status").message,
            DELETION_BLOCKED_MESSAGE
        );
        assert_eq!(memory.services.len(), 1);
        assert_eq!(memory.stateful_sets.len(), 1);

        memory
            .app_instances
            .delete(Some(TEST_NAMESPACE), "demo")
            .await
            .expect("remove reference");
        controller
            .reconcile_and_apply(&key("edge"))
            .await
            .expect("finalize");
        assert!(memory.public_service_instances.is_empty());
        assert!(memory.services.is_empty());
        assert!(memory.stateful_sets.is_empty());
    }

    #[test]
    fn released_services_follow_reference_changes() {
        let mut old = app_instance("demo", "web", "");
        old.spec.public_service_class = "edge".to_string();
        let mut new = old.clone();
        new.spec.public_service_class = "other".to_string();

        assert_eq!(
            released_public_services(&WatchEvent::Updated {
                old: old.clone(),
                new
            }),
            vec![key("edge")]
        );
        assert_eq!(
            released_public_services(&WatchEvent::Updated {
                old: old.clone(),
                new: old.clone()
            }),
            Vec::<ObjectKey>::new()
        );
        assert_eq!(
            released_public_services(&WatchEvent::Deleted(old.clone())),
            vec![key("edge")]
        );
        assert!(released_public_services(&WatchEvent::Added(old)).is_empty());
    }
}
