use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSetStatus;
use openapp::openapp::api::{AppInstance, AppTemplate, AppTemplateSpec, ExposeType};
use openapp::openapp::controller::publicserviceinstance::DELETION_BLOCKED_MESSAGE;
use openapp::openapp::controller::registry::{RegistryError, RegistrySource, RegistrySpec};
use openapp::openapp::controller::runtime::{ControllerRuntime, RunningControllers};
use openapp::openapp::k8s::memory::InMemoryCluster;
use openapp::openapp::k8s::ObjectClient;
use openapp::openapp::observability::health::HealthRegistry;
use openapp::openapp::test_support::{
    app_instance, eventually, public_service_instance, RegistryFixture, SERVICE_MANIFEST,
    STATEFULSET_MANIFEST, TEST_NAMESPACE, TEST_NODE_ADDRESS,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct OfflineRegistry;

#[async_trait]
impl RegistrySource for OfflineRegistry {
    async fn refresh(&self, _spec: &RegistrySpec, _checkout: &Path) -> Result<(), RegistryError> {
        Ok(())
    }
}

async fn start_controllers(memory: &InMemoryCluster, fixture: &RegistryFixture) -> RunningControllers {
    let runtime = ControllerRuntime::new(
        memory.cluster(),
        Arc::new(fixture.settings()),
        Arc::new(OfflineRegistry),
        HealthRegistry::new(),
    );
    runtime.start(CancellationToken::new()).await
}

fn app(memory: &InMemoryCluster, name: &str) -> Option<AppInstance> {
    memory.app_instances.snapshot(Some(TEST_NAMESPACE), name)
}

fn derived_count(instance: Option<AppInstance>) -> usize {
    instance
        .and_then(|instance| instance.status)
        .map(|status| status.derived_resources.len())
        .unwrap_or_default()
}

/// Stands in for the API server allocating a NodePort.
async fn assign_node_port(memory: &InMemoryCluster, name: &str, node_port: i32) {
    let mut service = memory
        .services
        .snapshot(Some(TEST_NAMESPACE), name)
        .expect("service exists");
    if let Some(port) = service
        .spec
        .as_mut()
        .and_then(|spec| spec.ports.as_mut())
        .and_then(|ports| ports.first_mut())
    {
        port.node_port = Some(node_port);
    }
    service.metadata.resource_version = None;
    memory
        .services
        .replace(Some(TEST_NAMESPACE), name, &service)
        .await
        .expect("assign node port");
}

fn local_url(memory: &InMemoryCluster, name: &str) -> String {
    app(memory, name)
        .and_then(|instance| instance.status)
        .map(|status| status.local_service_url)
        .unwrap_or_default()
}

fn public_service_derived_count(memory: &InMemoryCluster) -> usize {
    memory
        .public_service_instances
        .snapshot(Some(TEST_NAMESPACE), "gateway")
        .and_then(|instance| instance.status)
        .map(|status| status.derived_resources.len())
        .unwrap_or_default()
}

#[tokio::test]
async fn app_instance_runs_from_creation_to_removal() {
    let fixture = RegistryFixture::new();
    fixture.web_app_template("web", "Layer7");
    let memory = InMemoryCluster::new();
    let controllers = start_controllers(&memory, &fixture).await;
    let memory = &memory;

    memory
        .app_instances
        .create(Some(TEST_NAMESPACE), &app_instance("demo", "web", "port: 8080"))
        .await
        .expect("create instance");

    assert!(
        eventually(WAIT, move || async move { derived_count(app(memory, "demo")) == 3 }).await,
        "derived objects recorded in status"
    );
    let service = memory
        .services
        .snapshot(Some(TEST_NAMESPACE), "demo")
        .expect("service created");
    let labels = service.metadata.labels.clone().unwrap_or_default();
    assert_eq!(
        labels.get("app.openapp.dev/app-instance").map(String::as_str),
        Some("demo")
    );
    let instance = app(memory, "demo").expect("instance");
    assert!(instance
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&"app-instance-controller".to_string()));

    assert!(
        eventually(WAIT, move || async move {
            memory.app_templates.snapshot(None, "web").is_some()
        })
        .await,
        "template synced from registry"
    );

    let mut stateful_set = memory
        .stateful_sets
        .snapshot(Some(TEST_NAMESPACE), "demo")
        .expect("stateful set created");
    stateful_set.status = Some(StatefulSetStatus {
        ready_replicas: Some(1),
        replicas: 1,
        ..Default::default()
    });
    memory
        .stateful_sets
        .replace_status(Some(TEST_NAMESPACE), "demo", &stateful_set)
        .await
        .expect("mark stateful set ready");

    assign_node_port(memory, "demo", 30080).await;

    let expected_url = format!("http://{}:30080", TEST_NODE_ADDRESS);
    assert!(
        eventually(WAIT, move || {
            let expected_url = expected_url.clone();
            async move {
                app(memory, "demo")
                    .and_then(|instance| instance.status)
                    .is_some_and(|status| {
                        status.app_ready && status.local_service_url == expected_url
                    })
            }
        })
        .await,
        "readiness and local URL reported"
    );

    memory
        .app_instances
        .delete(Some(TEST_NAMESPACE), "demo")
        .await
        .expect("delete instance");
    assert!(
        eventually(WAIT, move || async move { app(memory, "demo").is_none() }).await,
        "finalizer released"
    );
    assert!(memory.services.is_empty());
    assert!(memory.stateful_sets.is_empty());
    assert!(memory
        .config_maps
        .snapshot(Some(TEST_NAMESPACE), "demo-config")
        .is_none());

    controllers.shutdown().await;
}

#[tokio::test]
async fn local_url_gets_scheme_once_template_arrives() {
    let fixture = RegistryFixture::new();
    let template_dir = fixture.web_app_template("web", "Layer7").dir().to_path_buf();
    // Manifests are resolvable but the AppTemplate object is not synced.
    std::fs::remove_file(template_dir.join("template.yaml")).expect("remove template document");
    let memory = InMemoryCluster::new();
    let controllers = start_controllers(&memory, &fixture).await;
    let memory = &memory;

    memory
        .app_instances
        .create(Some(TEST_NAMESPACE), &app_instance("demo", "web", "port: 8080"))
        .await
        .expect("create instance");
    assert!(eventually(WAIT, move || async move { derived_count(app(memory, "demo")) == 3 }).await);

    assign_node_port(memory, "demo", 30080).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(local_url(memory, "demo"), "", "no URL without the template");

    memory
        .app_templates
        .create(
            None,
            &AppTemplate::new(
                "web",
                AppTemplateSpec {
                    expose_type: ExposeType::Layer7,
                    ..Default::default()
                },
            ),
        )
        .await
        .expect("create template");
    let expected_url = format!("http://{}:30080", TEST_NODE_ADDRESS);
    assert!(
        eventually(WAIT, move || {
            let expected_url = expected_url.clone();
            async move { local_url(memory, "demo") == expected_url }
        })
        .await,
        "local URL carries the template scheme"
    );

    controllers.shutdown().await;
}

#[tokio::test]
async fn public_service_deletion_waits_for_referencing_apps() {
    let fixture = RegistryFixture::new();
    fixture.web_app_template("web", "Layer4");
    fixture
        .public_service_template("gateway", &["Layer7"])
        .manifest("service.yaml", SERVICE_MANIFEST)
        .manifest("statefulset.yaml", STATEFULSET_MANIFEST);
    let memory = InMemoryCluster::new();
    let controllers = start_controllers(&memory, &fixture).await;
    let memory = &memory;

    memory
        .public_service_instances
        .create(
            Some(TEST_NAMESPACE),
            &public_service_instance("gateway", "gateway", "port: 80"),
        )
        .await
        .expect("create public service");
    let mut demo = app_instance("demo", "web", "port: 8080");
    demo.spec.public_service_class = "gateway".to_string();
    memory
        .app_instances
        .create(Some(TEST_NAMESPACE), &demo)
        .await
        .expect("create instance");

    assert!(eventually(WAIT, move || async move { public_service_derived_count(memory) == 2 }).await);
    assert!(eventually(WAIT, move || async move { derived_count(app(memory, "demo")) == 3 }).await);
    let app_service = memory
        .services
        .snapshot(Some(TEST_NAMESPACE), "demo")
        .expect("app service");
    assert_eq!(
        app_service
            .metadata
            .labels
            .unwrap_or_default()
            .get("service.openapp.dev/expose-class")
            .map(String::as_str),
        Some("gateway")
    );

    memory
        .public_service_instances
        .delete(Some(TEST_NAMESPACE), "gateway")
        .await
        .expect("delete public service");
    assert!(
        eventually(WAIT, move || async move {
            memory
                .public_service_instances
                .snapshot(Some(TEST_NAMESPACE), "gateway")
                .and_then(|instance| instance.status)
                .is_some_and(|status| status.message == DELETION_BLOCKED_MESSAGE)
        })
        .await,
        "deletion blocked while referenced"
    );
    assert!(memory
        .stateful_sets
        .snapshot(Some(TEST_NAMESPACE), "gateway")
        .is_some());

    memory
        .app_instances
        .delete(Some(TEST_NAMESPACE), "demo")
        .await
        .expect("delete instance");
    assert!(
        eventually(WAIT, move || async move {
            memory
                .public_service_instances
                .snapshot(Some(TEST_NAMESPACE), "gateway")
                .is_none()
        })
        .await,
        "public service removed once unreferenced"
    );
    assert!(memory.services.is_empty());
    assert!(memory.stateful_sets.is_empty());

    controllers.shutdown().await;
}
