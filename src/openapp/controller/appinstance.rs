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

use crate::openapp::api::{AppInstance, DerivedResourceSet};
use crate::openapp::config::ControllerSettings;
use crate::openapp::controller::instance::{InstanceController, InstanceHooks, InstanceResource};
use crate::openapp::k8s::{Cluster, ObjectClient};
use crate::openapp::template::render::app_instance_values;
use crate::openapp::template::{OwnershipLabels, RenderError, TemplateKind, TemplateRegistry};
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;

pub const CONTROLLER_NAME: &str = "appinstance-controller";

pub type AppInstanceController = InstanceController<AppInstance, AppInstanceHooks>;

impl InstanceResource for AppInstance {
    const TEMPLATE_KIND: TemplateKind = TemplateKind::App;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>> {
        Arc::clone(&cluster.app_instances)
    }

    fn template_name(&self) -> &str {
        &self.spec.app_template
    }

    fn values(&self) -> Result<Value, RenderError> {
        app_instance_values(
            &self.name_any(),
            &self.spec.public_service_class,
            &self.spec.inputs,
        )
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

/// Services carry the public service class they are exposed through;
/// stateful workloads carry the instance generation so spec edits restart
/// them.
pub struct AppInstanceHooks {
    settings: Arc<ControllerSettings>,
}

impl AppInstanceHooks {
    pub fn new(settings: Arc<ControllerSettings>) -> Self {
        Self { settings }
    }
}

impl InstanceHooks<AppInstance> for AppInstanceHooks {
    fn controller(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn finalizer(&self) -> &str {
        &self.settings.finalizers.app_instance
    }

    fn ownership_label(&self) -> &str {
        &self.settings.labels.app_instance
    }

    fn labels(&self, instance: &AppInstance) -> OwnershipLabels {
        let labels = &self.settings.labels;
        let generation = instance.metadata.generation.unwrap_or_default().to_string();
        OwnershipLabels::new()
            .with(&labels.app_instance, &instance.name_any())
            .with_for_kind(
                "Service",
                &labels.expose_class,
                &instance.spec.public_service_class,
            )
            .with_for_kind("StatefulSet", &labels.instance_generation, &generation)
    }
}

pub fn app_instance_controller(
    cluster: Cluster,
    settings: Arc<ControllerSettings>,
) -> AppInstanceController {
    InstanceController::new(
        cluster,
        TemplateRegistry::new(&settings.registry_root),
        &settings.labels.instance_generation,
        AppInstanceHooks::new(settings.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapp::api::DerivedResource;
    use crate::openapp::controller::reconcile::Reconciler;
    use crate::openapp::controller::watch::ObjectKey;
    use crate::openapp::k8s::memory::{InMemoryCluster, Verb};
    use crate::openapp::k8s::ownership::{has_finalizer, label_value};
    use crate::openapp::test_support::{app_instance, RegistryFixture, TEST_NAMESPACE};

    struct Harness {
        memory: InMemoryCluster,
        controller: AppInstanceController,
        _registry: RegistryFixture,
    }

    fn harness() -> Harness {
        let registry = RegistryFixture::new();
        registry.web_app_template("web", "Layer7");
        let memory = InMemoryCluster::new();
        let controller = app_instance_controller(memory.cluster(), Arc::new(registry.settings()));
        Harness {
            memory,
            controller,
            _registry: registry,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some(TEST_NAMESPACE), name)
    }

    fn stored(harness: &Harness, name: &str) -> AppInstance {
        harness
            .memory
            .app_instances
            .snapshot(Some(TEST_NAMESPACE), name)
            .expect("instance")
    }

    #[tokio::test]
    async fn converge_records_every_manifest_in_order() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "web", "port: 8080"));

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("reconcile");

        let instance = stored(&harness, "demo");
        assert!(has_finalizer(&instance, "app-instance-controller"));
        let status = instance.status.expect("status");
        assert_eq!(
            status.derived_resources,
            vec![
                DerivedResource::new("v1", "ConfigMap", "demo-config"),
                DerivedResource::new("v1", "Service", "demo"),
                DerivedResource::new("apps/v1", "StatefulSet", "demo"),
            ]
        );
        assert!(status.message.is_empty());

        let config_map = harness
            .memory
            .config_maps
            .snapshot(Some(TEST_NAMESPACE), "demo-config")
            .expect("config map");
        assert_eq!(
            config_map.data.and_then(|data| data.get("port").cloned()),
            Some("8080".to_string())
        );
        let stateful_set = harness
            .memory
            .stateful_sets
            .snapshot(Some(TEST_NAMESPACE), "demo")
            .expect("stateful set");
        assert_eq!(
            label_value(&stateful_set, "instance.openapp.dev/instance-generation"),
            Some("1")
        );
        assert_eq!(
            label_value(&stateful_set, "app.openapp.dev/app-instance"),
            Some("demo")
        );
    }

    #[tokio::test]
    async fn second_reconcile_makes_no_writes() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "web", "port: 8080"));
        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("first");
        harness.memory.journal().clear();

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("second");
        assert!(harness.memory.journal().entries().is_empty());
    }

    #[tokio::test]
    async fn malformed_inputs_are_reported_without_retry() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "web", "- not\n- a mapping"));

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("malformed input is not retried");
        let status = stored(&harness, "demo").status.expect("status");
        assert!(!status.message.is_empty());
        assert!(harness.memory.config_maps.is_empty());
    }

    #[tokio::test]
    async fn api_failure_keeps_partial_set_and_retries() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "web", "port: 8080"));
        harness.memory.services.inject_failure(Verb::Create, "demo");

        let err = harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect_err("transient failure");
        assert!(!err.is_malformed_input());
        let status = stored(&harness, "demo").status.expect("status");
        assert_eq!(status.derived_resources.len(), 2);
        assert!(!status.message.is_empty());

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("retry succeeds");
        let status = stored(&harness, "demo").status.expect("status");
        assert_eq!(status.derived_resources.len(), 3);
        assert!(status.message.is_empty());
    }

    #[tokio::test]
    async fn unknown_template_is_a_no_op() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "missing", ""));
        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("no-op");
        assert!(harness.memory.services.is_empty());
        assert!(harness.memory.stateful_sets.is_empty());
    }

    #[tokio::test]
    async fn delete_cleans_recorded_and_labelled_objects() {
        let harness = harness();
        harness
            .memory
            .app_instances
            .seed(app_instance("demo", "web", "port: 8080"));
        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("reconcile");

        // Forget the recorded set to simulate an interrupted reconcile.
        let mut instance = stored(&harness, "demo");
        instance.set_derived_status(DerivedResourceSet::new(), String::new());
        harness
            .memory
            .app_instances
            .replace_status(Some(TEST_NAMESPACE), "demo", &instance)
            .await
            .expect("status");
        harness
            .memory
            .app_instances
            .delete(Some(TEST_NAMESPACE), "demo")
            .await
            .expect("delete");

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("finalize");
        assert!(harness.memory.config_maps.is_empty());
        assert!(harness.memory.services.is_empty());
        assert!(harness.memory.stateful_sets.is_empty());
        assert!(harness.memory.app_instances.is_empty());

        harness
            .controller
            .reconcile_and_apply(&key("demo"))
            .await
            .expect("repeat delete is a no-op");
    }
}
