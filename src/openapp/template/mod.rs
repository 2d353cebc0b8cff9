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

//! Template pipeline: locate a template's manifests inside the registry
//! checkouts, render them against an instance's values document and
//! materialize the result as cluster objects.

pub mod materialize;
pub mod render;
pub mod resolver;

pub use materialize::{MaterializeError, Materializer, OwnershipLabels};
pub use render::{render_manifest, RenderError};
pub use resolver::{ManifestKind, ManifestRef, TemplateKind, TemplateRegistry};
