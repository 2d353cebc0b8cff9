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

//! Custom resources served under the `app.openapp.dev` and
//! `service.openapp.dev` groups.

pub mod types;

pub use types::{
    AppInstance, AppInstanceSpec, AppInstanceStatus, AppTemplate, AppTemplateSpec,
    DerivedResource, DerivedResourceSet, ExposeType, PublicServiceInstance,
    PublicServiceInstanceSpec, PublicServiceInstanceStatus, PublicServiceTemplate,
    PublicServiceTemplateSpec,
};

use kube::CustomResourceExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

/// Every CustomResourceDefinition owned by the controllers.
pub fn custom_resource_definitions() -> Vec<CustomResourceDefinition> {
    vec![
        AppInstance::crd(),
        AppTemplate::crd(),
        PublicServiceInstance::crd(),
        PublicServiceTemplate::crd(),
    ]
}
