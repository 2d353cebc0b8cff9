use k8s_openapi::api::core::v1::Service;
use openapp::openapp::api::DerivedResourceSet;
use openapp::openapp::k8s::memory::InMemoryCluster;
use openapp::openapp::k8s::ownership::selector_for;
use openapp::openapp::template::render::{app_instance_values, public_service_values};
use openapp::openapp::template::{
    render_manifest, ManifestKind, Materializer, OwnershipLabels, TemplateKind,
};
use openapp::openapp::test_support::{RegistryFixture, SERVICE_MANIFEST, TEST_NAMESPACE};

const APP_LABEL: &str = "app.openapp.dev/app-instance";
const GENERATION_LABEL: &str = "instance.openapp.dev/instance-generation";

fn first_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port)
}

#[tokio::test]
async fn web_template_renders_and_materializes_in_dependency_order() {
    let fixture = RegistryFixture::new();
    fixture.web_app_template("web", "Layer7");
    let manifests = fixture
        .registry()
        .find_template_resources("web", TemplateKind::App);
    let kinds: Vec<ManifestKind> = manifests.iter().map(|manifest| manifest.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ManifestKind::ConfigMap,
            ManifestKind::Service,
            ManifestKind::StatefulSet
        ]
    );

    let values = app_instance_values("demo", "", "port: 8080").expect("values");
    let memory = InMemoryCluster::new();
    let materializer = Materializer::new(memory.cluster(), GENERATION_LABEL);
    let labels = OwnershipLabels::new()
        .with(APP_LABEL, "demo")
        .with_for_kind("StatefulSet", GENERATION_LABEL, "1");
    let mut derived = DerivedResourceSet::new();
    for manifest in &manifests {
        let rendered = render_manifest(&manifest.path, &values).expect("render");
        materializer
            .apply(&rendered, TEST_NAMESPACE, &labels, &mut derived)
            .await
            .expect("apply");
    }

    let names: Vec<String> = derived
        .iter()
        .map(|entry| format!("{}/{}", entry.kind, entry.name))
        .collect();
    assert_eq!(
        names,
        vec!["ConfigMap/demo-config", "Service/demo", "StatefulSet/demo"]
    );
    let config_map = memory
        .config_maps
        .snapshot(Some(TEST_NAMESPACE), "demo-config")
        .expect("config map");
    assert_eq!(
        config_map
            .data
            .unwrap_or_default()
            .get("port")
            .map(String::as_str),
        Some("8080")
    );
    let service = memory
        .services
        .snapshot(Some(TEST_NAMESPACE), "demo")
        .expect("service");
    assert_eq!(first_port(&service), Some(8080));

    let owned = materializer
        .find_owned(TEST_NAMESPACE, &selector_for(APP_LABEL, "demo"))
        .await
        .expect("find owned");
    assert_eq!(owned.len(), 3);
    for entry in owned.iter() {
        materializer
            .clean(entry, TEST_NAMESPACE)
            .await
            .expect("clean");
    }
    assert!(memory.config_maps.is_empty());
    assert!(memory.services.is_empty());
    assert!(memory.stateful_sets.is_empty());
}

#[tokio::test]
async fn later_registry_cannot_shadow_earlier_template() {
    let fixture = RegistryFixture::new();
    fixture
        .in_registry("a-primary")
        .public_service_template("gateway", &["Layer7"])
        .manifest("service.yaml", SERVICE_MANIFEST);
    fixture
        .in_registry("b-mirror")
        .public_service_template("gateway", &["Layer4"])
        .manifest("configmap.yaml", "kind: ConfigMap\n");

    let manifests = fixture
        .registry()
        .find_template_resources("gateway", TemplateKind::PublicService);
    assert_eq!(manifests.len(), 1);
    assert!(manifests[0].path.to_string_lossy().contains("a-primary"));

    let values = public_service_values("gateway", "port: 443").expect("values");
    let rendered = render_manifest(&manifests[0].path, &values).expect("render");
    assert!(rendered.contains("name: gateway"));
    assert!(rendered.contains("port: 443"));
}

#[test]
fn malformed_inputs_are_rejected_before_rendering() {
    let err = app_instance_values("demo", "", "- not\n- a mapping").expect_err("list inputs");
    assert!(err.to_string().contains("mapping"), "{err}");
}
