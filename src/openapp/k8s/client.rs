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

use super::kube_client::{cluster_api, namespaced_api, KubeObjectClient};
use super::{ClusterError, ObjectEvent};
use crate::openapp::api::{
    AppInstance, AppTemplate, PublicServiceInstance, PublicServiceTemplate,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use std::sync::Arc;

/// CRUD and watch access for a single object kind.
///
/// `namespace` is ignored for cluster-scoped kinds. For namespaced kinds
/// `None` on `list`/`watch` means every namespace.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClusterError>;

    /// Lists objects, optionally filtered by an equality label selector of
    /// the form `key=value[,key=value]`.
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError>;

    async fn create(&self, namespace: Option<&str>, object: &K) -> Result<K, ClusterError>;

    /// Replaces everything but the status subresource. A set
    /// `metadata.resourceVersion` must match the stored one.
    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError>;

    /// Replaces only the status subresource.
    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError>;

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClusterError>;

    fn watch(&self, namespace: Option<&str>)
        -> BoxStream<'static, Result<ObjectEvent<K>, ClusterError>>;
}

/// Every object kind the controllers read or write.
#[derive(Clone)]
pub struct Cluster {
    pub services: Arc<dyn ObjectClient<Service>>,
    pub config_maps: Arc<dyn ObjectClient<ConfigMap>>,
    pub stateful_sets: Arc<dyn ObjectClient<StatefulSet>>,
    pub app_instances: Arc<dyn ObjectClient<AppInstance>>,
    pub app_templates: Arc<dyn ObjectClient<AppTemplate>>,
    pub public_service_instances: Arc<dyn ObjectClient<PublicServiceInstance>>,
    pub public_service_templates: Arc<dyn ObjectClient<PublicServiceTemplate>>,
}

impl Cluster {
    pub fn from_client(client: kube::Client) -> Self {
        Self {
            services: Arc::new(KubeObjectClient::new(client.clone(), namespaced_api::<Service>)),
            config_maps: Arc::new(KubeObjectClient::new(
                client.clone(),
                namespaced_api::<ConfigMap>,
            )),
            stateful_sets: Arc::new(KubeObjectClient::new(
                client.clone(),
                namespaced_api::<StatefulSet>,
            )),
            app_instances: Arc::new(KubeObjectClient::new(
                client.clone(),
                namespaced_api::<AppInstance>,
            )),
            app_templates: Arc::new(KubeObjectClient::new(
                client.clone(),
                cluster_api::<AppTemplate>,
            )),
            public_service_instances: Arc::new(KubeObjectClient::new(
                client.clone(),
                namespaced_api::<PublicServiceInstance>,
            )),
            public_service_templates: Arc::new(KubeObjectClient::new(
                client,
                cluster_api::<PublicServiceTemplate>,
            )),
        }
    }
}
