use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use openapp::openapp::api::{AppTemplate, ExposeType, PublicServiceTemplate};
use openapp::openapp::controller::registry::{
    RegistryController, RegistryError, RegistrySource, RegistrySpec,
};
use openapp::openapp::controller::template_sync::TemplateSyncController;
use openapp::openapp::k8s::memory::InMemoryCluster;
use openapp::openapp::test_support::RegistryFixture;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Stands in for a remote registry: each refresh writes the currently
/// published template documents into the checkout.
#[derive(Default)]
struct PublishedRegistry {
    files: Mutex<BTreeMap<String, String>>,
}

impl PublishedRegistry {
    fn publish(&self, relative: &str, content: &str) {
        self.files
            .lock()
            .expect("lock")
            .insert(relative.to_string(), content.to_string());
    }
}

#[async_trait]
impl RegistrySource for PublishedRegistry {
    async fn refresh(&self, _spec: &RegistrySpec, checkout: &Path) -> Result<(), RegistryError> {
        let files = self.files.lock().expect("lock").clone();
        for (relative, content) in files {
            let path = checkout.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("create checkout directory");
            }
            fs::write(path, content).expect("write template");
        }
        Ok(())
    }
}

fn app_template(title: &str, expose_type: &str) -> String {
    format!(
        "apiVersion: app.openapp.dev/v1alpha1\nkind: AppTemplate\nmetadata:\n  name: blog\nspec:\n  title: {title}\n  exposeType: {expose_type}\n"
    )
}

const GATEWAY_TEMPLATE: &str = "apiVersion: service.openapp.dev/v1alpha1\nkind: PublicServiceTemplate\nmetadata:\n  name: gateway\nspec:\n  title: Gateway\n  exposeTypes:\n    - Layer4\n    - Layer7\n";

fn system_config_map() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("openapp-config".to_string()),
            namespace: Some("openapp-system".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "registry".to_string(),
            "https://github.com/openapp-dev/openapp-registry@main".to_string(),
        )])),
        ..Default::default()
    }
}

#[tokio::test]
async fn refreshed_registry_content_becomes_template_objects() {
    let fixture = RegistryFixture::new();
    let memory = InMemoryCluster::new();
    memory.config_maps.seed(system_config_map());
    let source = Arc::new(PublishedRegistry::default());
    source.publish("app-template/blog/template.yaml", &app_template("Blog", "Layer7"));
    source.publish("publicservice-template/gateway/template.yaml", GATEWAY_TEMPLATE);

    let settings = Arc::new(fixture.settings());
    let registry = RegistryController::new(
        memory.cluster().config_maps,
        source.clone(),
        Arc::clone(&settings),
    );
    let apps = TemplateSyncController::<AppTemplate>::new(
        "apptemplate-controller",
        &memory.cluster(),
        fixture.registry(),
    );
    let public_services = TemplateSyncController::<PublicServiceTemplate>::new(
        "publicservicetemplate-controller",
        &memory.cluster(),
        fixture.registry(),
    );

    registry.refresh().await.expect("refresh registry");
    assert!(fixture
        .root()
        .join("openapp-registry/app-template/blog/template.yaml")
        .is_file());
    let stamped = memory
        .config_maps
        .snapshot(Some("openapp-system"), "openapp-config")
        .and_then(|config_map| config_map.metadata.annotations)
        .and_then(|annotations| annotations.get("registry.openapp.dev/update-time").cloned());
    assert!(stamped.is_some());

    let summary = apps.sync().await.expect("sync app templates");
    assert_eq!(summary.created, 1);
    public_services
        .sync()
        .await
        .expect("sync public service templates");
    let gateway = memory
        .public_service_templates
        .snapshot(None, "gateway")
        .expect("gateway template");
    assert_eq!(
        gateway.spec.expose_types,
        vec![ExposeType::Layer4, ExposeType::Layer7]
    );

    source.publish("app-template/blog/template.yaml", &app_template("Blog v2", "Layer4"));
    registry.refresh().await.expect("refresh registry");
    let summary = apps.sync().await.expect("sync app templates");
    assert_eq!(summary.updated, 1);
    let blog = memory
        .app_templates
        .snapshot(None, "blog")
        .expect("blog template");
    assert_eq!(blog.spec.title, "Blog v2");
    assert_eq!(blog.spec.expose_type, ExposeType::Layer4);

    let summary = apps.sync().await.expect("sync app templates");
    assert_eq!(summary.unchanged, 1);
}

#[tokio::test]
async fn missing_system_config_map_skips_refresh() {
    let fixture = RegistryFixture::new();
    let memory = InMemoryCluster::new();
    let source = Arc::new(PublishedRegistry::default());
    source.publish("app-template/blog/template.yaml", &app_template("Blog", "Layer7"));
    let registry = RegistryController::new(
        memory.cluster().config_maps,
        source,
        Arc::new(fixture.settings()),
    );

    registry.refresh().await.expect("refresh is a no-op");
    assert!(!fixture.root().join("openapp-registry").exists());
    assert!(memory.config_maps.is_empty());
}
