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

//! Generic instance reconciler shared by AppInstance and
//! PublicServiceInstance.
//!
//! An instance moves from pending (no finalizer) to reconciling (finalizer
//! present, derived objects converging) to deleting (deletion timestamp
//! set). The finalizer is released only after every recorded or labelled
//! derived object is gone.

use crate::openapp::api::DerivedResourceSet;
use crate::openapp::controller::reconcile::{ReconcileData, Reconciler};
use crate::openapp::controller::watch::{ObjectKey, WatchEvent};
use crate::openapp::k8s::ownership::{
    add_finalizer, has_finalizer, is_terminating, remove_finalizer, selector_for,
};
use crate::openapp::k8s::{Cluster, ClusterError, ObjectClient};
use crate::openapp::logger::{log_info, log_warn};
use crate::openapp::template::{
    render_manifest, MaterializeError, Materializer, OwnershipLabels, RenderError, TemplateKind,
    TemplateRegistry,
};
use async_trait::async_trait;
use kube::Resource;
use serde_json::Value;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum InstanceError {
    Render(RenderError),
    Materialize(MaterializeError),
    Cluster(ClusterError),
}

impl Display for InstanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InstanceError::Render(err) => write!(f, "render failed: {}", err),
            InstanceError::Materialize(err) => write!(f, "{}", err),
            InstanceError::Cluster(err) => write!(f, "{}", err),
        }
    }
}

impl Error for InstanceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InstanceError::Render(err) => Some(err),
            InstanceError::Materialize(err) => Some(err),
            InstanceError::Cluster(err) => Some(err),
        }
    }
}

impl From<RenderError> for InstanceError {
    fn from(err: RenderError) -> Self {
        InstanceError::Render(err)
    }
}

impl From<MaterializeError> for InstanceError {
    fn from(err: MaterializeError) -> Self {
        InstanceError::Materialize(err)
    }
}

impl From<ClusterError> for InstanceError {
    fn from(err: ClusterError) -> Self {
        InstanceError::Cluster(err)
    }
}

impl InstanceError {
    /// Bad inputs or templates; retrying without a user edit cannot help.
    pub fn is_malformed_input(&self) -> bool {
        match self {
            InstanceError::Render(_) => true,
            InstanceError::Materialize(err) => err.is_malformed_input(),
            InstanceError::Cluster(_) => false,
        }
    }
}

/// Accessors the generic controller needs from an instance kind.
pub trait InstanceResource: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    const TEMPLATE_KIND: TemplateKind;

    fn client(cluster: &Cluster) -> Arc<dyn ObjectClient<Self>>;

    fn template_name(&self) -> &str;

    /// Values document handed to the manifest renderer.
    fn values(&self) -> Result<Value, RenderError>;

    fn derived_resources(&self) -> DerivedResourceSet;

    fn status_message(&self) -> &str;

    fn set_derived_status(&mut self, derived: DerivedResourceSet, message: String);
}

/// Kind-specific behavior plugged into [`InstanceController`].
#[async_trait]
pub trait InstanceHooks<I: InstanceResource>: Send + Sync {
    /// Controller name used for logs, spans and metrics.
    fn controller(&self) -> &'static str;

    fn finalizer(&self) -> &str;

    /// Label key binding derived objects to their instance.
    fn ownership_label(&self) -> &str;

    fn labels(&self, instance: &I) -> OwnershipLabels;

    /// `Some(message)` holds the instance in the deleting state.
    async fn deletion_guard(&self, _instance: &I) -> Result<Option<String>, InstanceError> {
        Ok(None)
    }
}

pub struct InstanceObservation {
    terminating: bool,
    finalized: bool,
}

pub enum InstancePlan<I> {
    Converge(I),
    Finalize(I),
    Idle,
}

pub struct InstanceController<I, H> {
    client: Arc<dyn ObjectClient<I>>,
    registry: TemplateRegistry,
    materializer: Materializer,
    hooks: H,
}

/// Whether an instance event needs a reconcile: first sight, a spec change
/// (generation bump) or the start of deletion.
pub fn needs_reconcile<I: Resource>(event: &WatchEvent<I>) -> bool {
    match event {
        WatchEvent::Added(_) => true,
        WatchEvent::Updated { old, new } => {
            old.meta().generation != new.meta().generation
                || old.meta().deletion_timestamp.is_some() != new.meta().deletion_timestamp.is_some()
        }
        WatchEvent::Deleted(_) => false,
    }
}

impl<I, H> InstanceController<I, H>
where
    I: InstanceResource,
    H: InstanceHooks<I>,
{
    pub fn new(
        cluster: Cluster,
        registry: TemplateRegistry,
        generation_label: &str,
        hooks: H,
    ) -> Self {
        Self {
            client: I::client(&cluster),
            registry,
            materializer: Materializer::new(cluster, generation_label),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    async fn converge(&self, key: &ObjectKey, mut instance: I) -> Result<(), InstanceError> {
        let namespace = key.namespace().unwrap_or_default();
        if add_finalizer(&mut instance, self.hooks.finalizer()) {
            instance = self
                .client
                .replace(key.namespace(), &key.name, &instance)
                .await?;
        }

        let manifests = self
            .registry
            .find_template_resources(instance.template_name(), I::TEMPLATE_KIND);
        if manifests.is_empty() {
            let key_text = key.to_string();
            log_warn(
                self.hooks.controller(),
                "Template has no manifests; nothing to reconcile",
                &[
                    ("instance", key_text.as_str()),
                    ("template", instance.template_name()),
                ],
            );
            return Ok(());
        }

        let previous = instance.derived_resources();
        let values = match instance.values() {
            Ok(values) => values,
            Err(err) => return self.record_failure(key, instance, previous, err.into()).await,
        };
        let labels = self.hooks.labels(&instance);

        let mut derived = DerivedResourceSet::new();
        for manifest in &manifests {
            let result = match render_manifest(&manifest.path, &values) {
                Ok(rendered) => self
                    .materializer
                    .apply(&rendered, namespace, &labels, &mut derived)
                    .await
                    .map_err(InstanceError::from),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                let partial = previous.union(&derived);
                return self.record_failure(key, instance, partial, err).await;
            }
        }

        let count = derived.len().to_string();
        self.write_status(key, instance, derived, String::new()).await?;
        let key_text = key.to_string();
        log_info(
            self.hooks.controller(),
            "Reconciled instance",
            &[("instance", key_text.as_str()), ("derived", count.as_str())],
        );
        Ok(())
    }

    /// Malformed input is reported on status and not retried; anything else
    /// is retried after a best-effort status write.
    async fn record_failure(
        &self,
        key: &ObjectKey,
        instance: I,
        derived: DerivedResourceSet,
        err: InstanceError,
    ) -> Result<(), InstanceError> {
        let key_text = key.to_string();
        let message = err.to_string();
        if err.is_malformed_input() {
            log_warn(
                self.hooks.controller(),
                "Abandoning reconcile on malformed input",
                &[("instance", key_text.as_str()), ("error", message.as_str())],
            );
            return self.write_status(key, instance, derived, message).await;
        }

        if let Err(status_err) = self.write_status(key, instance, derived, message).await {
            let error_text = status_err.to_string();
            log_warn(
                self.hooks.controller(),
                "Failed to record partial derived resources",
                &[("instance", key_text.as_str()), ("error", error_text.as_str())],
            );
        }
        Err(err)
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        mut instance: I,
        derived: DerivedResourceSet,
        message: String,
    ) -> Result<(), InstanceError> {
        if instance.derived_resources() == derived && instance.status_message() == message {
            return Ok(());
        }
        instance.set_derived_status(derived, message);
        self.client
            .replace_status(key.namespace(), &key.name, &instance)
            .await?;
        Ok(())
    }

    async fn finalize(&self, key: &ObjectKey, mut instance: I) -> Result<(), InstanceError> {
        let key_text = key.to_string();
        if let Some(message) = self.hooks.deletion_guard(&instance).await? {
            log_info(
                self.hooks.controller(),
                "Deletion blocked",
                &[("instance", key_text.as_str()), ("reason", message.as_str())],
            );
            let recorded = instance.derived_resources();
            return self.write_status(key, instance, recorded, message).await;
        }

        let namespace = key.namespace().unwrap_or_default();
        let selector = selector_for(self.hooks.ownership_label(), &key.name);
        let owned = self.materializer.find_owned(namespace, &selector).await?;
        let doomed = instance.derived_resources().union(&owned);
        for entry in doomed.iter() {
            self.materializer.clean(entry, namespace).await?;
        }

        if remove_finalizer(&mut instance, self.hooks.finalizer()) {
            match self
                .client
                .replace(key.namespace(), &key.name, &instance)
                .await
            {
                Err(err) if err.is_not_found() => {}
                other => {
                    other?;
                }
            }
        }
        let count = doomed.len().to_string();
        log_info(
            self.hooks.controller(),
            "Released instance after cleaning derived resources",
            &[("instance", key_text.as_str()), ("cleaned", count.as_str())],
        );
        Ok(())
    }
}

#[async_trait]
impl<I, H> Reconciler for InstanceController<I, H>
where
    I: InstanceResource,
    H: InstanceHooks<I>,
{
    type Desired = I;
    type Observed = InstanceObservation;
    type Plan = InstancePlan<I>;
    type Error = InstanceError;

    fn kind(&self) -> &'static str {
        self.hooks.controller()
    }

    async fn fetch(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReconcileData<I, InstanceObservation>>, InstanceError> {
        let Some(instance) = self.client.get(key.namespace(), &key.name).await? else {
            return Ok(None);
        };
        let observed = InstanceObservation {
            terminating: is_terminating(&instance),
            finalized: has_finalizer(&instance, self.hooks.finalizer()),
        };
        Ok(Some(ReconcileData {
            desired: instance,
            observed,
        }))
    }

    fn diff(
        &self,
        _key: &ObjectKey,
        desired: &I,
        observed: &InstanceObservation,
    ) -> Result<InstancePlan<I>, InstanceError> {
        Ok(match (observed.terminating, observed.finalized) {
            (true, true) => InstancePlan::Finalize(desired.clone()),
            (true, false) => InstancePlan::Idle,
            (false, _) => InstancePlan::Converge(desired.clone()),
        })
    }

    async fn apply(&self, key: &ObjectKey, plan: InstancePlan<I>) -> Result<(), InstanceError> {
        match plan {
            InstancePlan::Converge(instance) => self.converge(key, instance).await,
            InstancePlan::Finalize(instance) => self.finalize(key, instance).await,
            InstancePlan::Idle => Ok(()),
        }
    }
}
