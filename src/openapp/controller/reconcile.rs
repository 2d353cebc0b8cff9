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

use crate::openapp::controller::watch::ObjectKey;
use async_trait::async_trait;
use std::error::Error;

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

/// Shared reconciliation interface used by the keyed controllers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Send + Sync;
    type Plan: Send;
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    /// Fetches the desired spec and observed state. Returning `Ok(None)`
    /// indicates the object no longer exists and no further work is required.
    async fn fetch(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error>;

    /// Computes the plan needed to align observed state with the desired spec.
    fn diff(
        &self,
        key: &ObjectKey,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    /// Applies the previously computed plan.
    async fn apply(&self, key: &ObjectKey, plan: Self::Plan) -> Result<(), Self::Error>;

    /// Performs fetch and diff, returning a plan if the object still exists.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Option<Self::Plan>, Self::Error> {
        match self.fetch(key).await? {
            Some(data) => Ok(Some(self.diff(key, &data.desired, &data.observed)?)),
            None => Ok(None),
        }
    }

    /// Runs the full reconciliation pipeline, applying the plan when necessary.
    async fn reconcile_and_apply(&self, key: &ObjectKey) -> Result<(), Self::Error> {
        if let Some(plan) = self.reconcile(key).await? {
            self.apply(key, plan).await?;
        }
        Ok(())
    }
}
