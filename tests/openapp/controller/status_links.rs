use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use openapp::openapp::api::{
    ExposeType, PublicServiceInstance, PublicServiceTemplate, PublicServiceTemplateSpec,
};
use openapp::openapp::config::LabelKeys;
use openapp::openapp::controller::link::LinkController;
use openapp::openapp::controller::reconcile::Reconciler;
use openapp::openapp::controller::status::ReadinessController;
use openapp::openapp::controller::watch::ObjectKey;
use openapp::openapp::k8s::memory::InMemoryCluster;
use openapp::openapp::test_support::{public_service_instance, TEST_NAMESPACE, TEST_NODE_ADDRESS};
use openapp::openapp::util::net::StaticAddressResolver;
use std::collections::BTreeMap;
use std::sync::Arc;

fn owned_meta(name: &str, owner: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(TEST_NAMESPACE.to_string()),
        labels: Some(BTreeMap::from([(
            LabelKeys::default().publicservice_instance,
            owner.to_string(),
        )])),
        ..Default::default()
    }
}

fn stateful_set(name: &str, owner: &str, ready_replicas: i32) -> StatefulSet {
    StatefulSet {
        metadata: owned_meta(name, owner),
        status: Some(StatefulSetStatus {
            replicas: 1,
            ready_replicas: Some(ready_replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_port_service(name: &str, owner: &str, node_port: i32) -> Service {
    Service {
        metadata: owned_meta(name, owner),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                port: 80,
                node_port: Some(node_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn template(name: &str, expose_types: Vec<ExposeType>) -> PublicServiceTemplate {
    PublicServiceTemplate::new(
        name,
        PublicServiceTemplateSpec {
            title: name.to_string(),
            expose_types,
            ..Default::default()
        },
    )
}

fn gateway(memory: &InMemoryCluster) -> PublicServiceInstance {
    memory
        .public_service_instances
        .snapshot(Some(TEST_NAMESPACE), "gateway")
        .expect("public service instance")
}

fn key() -> ObjectKey {
    ObjectKey::new(Some(TEST_NAMESPACE), "gateway")
}

fn link_controller(memory: &InMemoryCluster) -> LinkController<PublicServiceInstance> {
    LinkController::new(
        "publicserviceinstance-link-controller",
        memory.cluster(),
        &LabelKeys::default().publicservice_instance,
        Arc::new(StaticAddressResolver::new(TEST_NODE_ADDRESS)),
    )
}

#[tokio::test]
async fn public_service_readiness_tracks_any_ready_stateful_set() {
    let memory = InMemoryCluster::new();
    memory
        .public_service_instances
        .seed(public_service_instance("gateway", "gateway", ""));
    memory
        .stateful_sets
        .seed(stateful_set("gateway-db", "gateway", 0));
    let controller = ReadinessController::<PublicServiceInstance>::new(
        "publicserviceinstance-status-controller",
        &memory.cluster(),
        &LabelKeys::default().publicservice_instance,
    );

    controller.reconcile_and_apply(&key()).await.expect("reconcile");
    assert!(!gateway(&memory)
        .status
        .is_some_and(|status| status.public_service_ready));

    memory
        .stateful_sets
        .seed(stateful_set("gateway-proxy", "gateway", 1));
    controller.reconcile_and_apply(&key()).await.expect("reconcile");
    assert!(gateway(&memory)
        .status
        .is_some_and(|status| status.public_service_ready));

    memory
        .stateful_sets
        .seed(stateful_set("other", "other-gateway", 1));
    controller.reconcile_and_apply(&key()).await.expect("reconcile");
    assert!(gateway(&memory)
        .status
        .is_some_and(|status| status.public_service_ready));
}

#[tokio::test]
async fn public_service_url_follows_template_expose_types() {
    let memory = InMemoryCluster::new();
    memory
        .public_service_instances
        .seed(public_service_instance("gateway", "gateway", ""));
    memory
        .services
        .seed(node_port_service("gateway", "gateway", 31000));
    let controller = link_controller(&memory);

    // No template yet: public services default to HTTP exposure.
    controller.reconcile_and_apply(&key()).await.expect("reconcile");
    let status = gateway(&memory).status.expect("status");
    assert_eq!(
        status.local_service_url,
        format!("http://{}:31000", TEST_NODE_ADDRESS)
    );

    memory
        .public_service_templates
        .seed(template("gateway", vec![ExposeType::Layer4]));
    controller.reconcile_and_apply(&key()).await.expect("reconcile");
    let status = gateway(&memory).status.expect("status");
    assert_eq!(status.local_service_url, format!("{}:31000", TEST_NODE_ADDRESS));
}

#[tokio::test]
async fn first_service_by_name_provides_the_url() {
    let memory = InMemoryCluster::new();
    memory
        .public_service_instances
        .seed(public_service_instance("gateway", "gateway", ""));
    memory
        .public_service_templates
        .seed(template("gateway", vec![ExposeType::Layer4]));
    memory
        .services
        .seed(node_port_service("gateway-b", "gateway", 32002));
    memory
        .services
        .seed(node_port_service("gateway-a", "gateway", 32001));

    link_controller(&memory)
        .reconcile_and_apply(&key())
        .await
        .expect("reconcile");
    let status = gateway(&memory).status.expect("status");
    assert_eq!(status.local_service_url, format!("{}:32001", TEST_NODE_ADDRESS));
}
