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

use super::client::ObjectClient;
use super::{ClusterError, ObjectEvent};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::error::ErrorResponse;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

type ApiFactory<K> = fn(&Client, Option<&str>) -> Api<K>;

/// Builds an [`Api`] for a namespaced kind, spanning all namespaces when no
/// namespace is given.
pub fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Builds an [`Api`] for a cluster-scoped kind.
pub fn cluster_api<K>(client: &Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = ()>,
{
    Api::all(client.clone())
}

/// [`ObjectClient`] backed by the Kubernetes API server.
pub struct KubeObjectClient<K> {
    client: Client,
    make_api: ApiFactory<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectClient<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new(client: Client, make_api: ApiFactory<K>) -> Self {
        Self {
            client,
            make_api,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.make_api)(&self.client, namespace)
    }
}

fn map_kube_error<K: Resource<DynamicType = ()>>(name: &str, err: kube::Error) -> ClusterError {
    let kind = K::kind(&()).to_string();
    match err {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ErrorResponse { code: 409, reason, .. }) if reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(ErrorResponse { code: 409, message, .. }) => {
            ClusterError::Conflict(message)
        }
        kube::Error::Api(ErrorResponse {
            code: 400 | 422,
            message,
            ..
        }) => ClusterError::Invalid(message),
        kube::Error::SerdeError(err) => ClusterError::Serialization(err),
        other => ClusterError::Api(Box::new(other)),
    }
}

fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjectClient<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClusterError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error::<K>(name, err))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(selector);
        }
        self.api(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|err| map_kube_error::<K>("", err))
    }

    async fn create(&self, namespace: Option<&str>, object: &K) -> Result<K, ClusterError> {
        let name = object_name(object);
        self.api(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|err| map_kube_error::<K>(&name, err))
    }

    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        self.api(namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|err| map_kube_error::<K>(name, err))
    }

    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let body = serde_json::to_vec(object)?;
        self.api(namespace)
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(|err| map_kube_error::<K>(name, err))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_kube_error::<K>(name, err))
    }

    fn watch(
        &self,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<ObjectEvent<K>, ClusterError>> {
        watcher(self.api(namespace), watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Apply(object)) => Ok(ObjectEvent::Applied(object)),
                Ok(watcher::Event::Delete(object)) => Ok(ObjectEvent::Deleted(object)),
                Ok(watcher::Event::Init) => Ok(ObjectEvent::InitStarted),
                Ok(watcher::Event::InitApply(object)) => Ok(ObjectEvent::InitApplied(object)),
                Ok(watcher::Event::InitDone) => Ok(ObjectEvent::InitDone),
                Err(err) => Err(ClusterError::Api(Box::new(err))),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} failure", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn maps_status_codes_to_cluster_errors() {
        assert!(map_kube_error::<Service>("demo", api_error(404, "NotFound")).is_not_found());
        assert!(
            map_kube_error::<Service>("demo", api_error(409, "AlreadyExists")).is_already_exists()
        );
        assert!(map_kube_error::<Service>("demo", api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            map_kube_error::<Service>("demo", api_error(422, "Invalid")),
            ClusterError::Invalid(_)
        ));
        assert!(matches!(
            map_kube_error::<Service>("demo", api_error(500, "InternalError")),
            ClusterError::Api(_)
        ));
    }

    #[test]
    fn not_found_names_kind_and_object() {
        let err = map_kube_error::<Service>("web", api_error(404, "NotFound"));
        assert_eq!(err.to_string(), "Service 'web' not found");
    }
}
