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

//! Propagates Service addresses onto the owning instance as local and
//! external URLs.

use crate::openapp::api::{AppInstance, ExposeType, PublicServiceInstance};
use crate::openapp::controller::instance::InstanceResource;
use crate::openapp::controller::reconcile::{ReconcileData, Reconciler};
use crate::openapp::controller::watch::ObjectKey;
use crate::openapp::k8s::ownership::selector_for;
use crate::openapp::k8s::{Cluster, ClusterError, ObjectClient};
use crate::openapp::logger::log_warn;
use crate::openapp::util::net::LocalAddressResolver;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::sync::Arc;

const DEFAULT_INGRESS_PORT: i32 = 80;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceLinks {
    pub local: String,
    pub external: String,
}

impl ServiceLinks {
    fn with_scheme(self, expose_type: ExposeType) -> Self {
        if expose_type != ExposeType::Layer7 {
            return self;
        }
        let prefix = |url: String| {
            if url.is_empty() {
                url
            } else {
                format!("http://{}", url)
            }
        };
        Self {
            local: prefix(self.local),
            external: prefix(self.external),
        }
    }
}

/// Instance kinds carrying service URLs.
#[async_trait]
pub trait LinkTarget: InstanceResource {
    fn links(&self) -> ServiceLinks;

    fn set_links(&mut self, links: ServiceLinks);

    /// Expose policy of the instance's template.
    async fn expose_type(&self, cluster: &Cluster) -> Result<ExposeType, ClusterError>;
}

#[async_trait]
impl LinkTarget for AppInstance {
    fn links(&self) -> ServiceLinks {
        self.status
            .as_ref()
            .map(|status| ServiceLinks {
                local: status.local_service_url.clone(),
                external: status.external_service_url.clone(),
            })
            .unwrap_or_default()
    }

    fn set_links(&mut self, links: ServiceLinks) {
        let status = self.status.get_or_insert_with(Default::default);
        status.local_service_url = links.local;
        status.external_service_url = links.external;
    }

    /// An AppTemplate that is not synced yet is `NotFound`; the key is retried.
    async fn expose_type(&self, cluster: &Cluster) -> Result<ExposeType, ClusterError> {
        cluster
            .app_templates
            .get(None, &self.spec.app_template)
            .await?
            .map(|template| template.spec.expose_type)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "AppTemplate".to_string(),
                name: self.spec.app_template.clone(),
            })
    }
}

#[async_trait]
impl LinkTarget for PublicServiceInstance {
    fn links(&self) -> ServiceLinks {
        ServiceLinks {
            local: self
                .status
                .as_ref()
                .map(|status| status.local_service_url.clone())
                .unwrap_or_default(),
            external: String::new(),
        }
    }

    /// Public services are only reached from inside the cluster.
    fn set_links(&mut self, links: ServiceLinks) {
        self.status.get_or_insert_with(Default::default).local_service_url = links.local;
    }

    async fn expose_type(&self, cluster: &Cluster) -> Result<ExposeType, ClusterError> {
        let template = cluster
            .public_service_templates
            .get(None, &self.spec.public_service_template)
            .await?;
        Ok(template
            .map(|template| template.spec.preferred_expose_type())
            .unwrap_or(ExposeType::Layer7))
    }
}

/// Addresses of `service` before any scheme is applied. `node_address`
/// is `None` when the node address could not be discovered.
pub fn service_links(service: &Service, node_address: Option<&str>) -> ServiceLinks {
    let node_port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|port| port.node_port);
    let local = match (node_address, node_port) {
        (Some(address), Some(port)) => format!("{}:{}", address, port),
        _ => String::new(),
    };

    let external = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|balancer| balancer.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|ingress| {
            let host = ingress
                .hostname
                .as_deref()
                .filter(|host| !host.is_empty())
                .or(ingress.ip.as_deref())
                .filter(|host| !host.is_empty())?;
            let port = ingress
                .ports
                .as_ref()
                .and_then(|ports| ports.first())
                .map(|port| port.port)
                .unwrap_or(DEFAULT_INGRESS_PORT);
            Some(format!("{}:{}", host, port))
        })
        .unwrap_or_default();

    ServiceLinks { local, external }
}

pub struct LinkController<I> {
    name: &'static str,
    cluster: Cluster,
    instances: Arc<dyn ObjectClient<I>>,
    ownership_label: String,
    resolver: Arc<dyn LocalAddressResolver>,
}

impl<I: LinkTarget> LinkController<I> {
    pub fn new(
        name: &'static str,
        cluster: Cluster,
        ownership_label: &str,
        resolver: Arc<dyn LocalAddressResolver>,
    ) -> Self {
        Self {
            name,
            instances: I::client(&cluster),
            cluster,
            ownership_label: ownership_label.to_string(),
            resolver,
        }
    }

    pub fn ownership_label(&self) -> &str {
        &self.ownership_label
    }

    fn node_address(&self) -> Option<String> {
        match self.resolver.local_address() {
            Ok(address) => Some(address),
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    self.name,
                    "Failed to resolve node address; local URL left empty",
                    &[("error", error_text.as_str())],
                );
                None
            }
        }
    }
}

#[async_trait]
impl<I: LinkTarget> Reconciler for LinkController<I> {
    type Desired = ServiceLinks;
    type Observed = I;
    type Plan = Option<I>;
    type Error = ClusterError;

    fn kind(&self) -> &'static str {
        self.name
    }

    async fn fetch(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReconcileData<ServiceLinks, I>>, ClusterError> {
        let Some(instance) = self.instances.get(key.namespace(), &key.name).await? else {
            return Ok(None);
        };
        let selector = selector_for(&self.ownership_label, &key.name);
        let mut services = self
            .cluster
            .services
            .list(key.namespace(), Some(&selector))
            .await?;
        services.sort_by_key(|service| service.name_any());

        let links = match services.first() {
            Some(service) => {
                let node_address = self.node_address();
                let expose_type = instance.expose_type(&self.cluster).await?;
                service_links(service, node_address.as_deref()).with_scheme(expose_type)
            }
            None => ServiceLinks::default(),
        };
        Ok(Some(ReconcileData {
            desired: links,
            observed: instance,
        }))
    }

    fn diff(
        &self,
        _key: &ObjectKey,
        desired: &ServiceLinks,
        observed: &I,
    ) -> Result<Option<I>, ClusterError> {
        if observed.links() == *desired {
            return Ok(None);
        }
        let mut next = observed.clone();
        next.set_links(desired.clone());
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
