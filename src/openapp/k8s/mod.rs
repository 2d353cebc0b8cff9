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

//! Typed access to cluster objects. Controllers only talk to the
//! [`ObjectClient`] seam; production wires it to the API server through
//! `kube`, tests through [`memory::InMemoryCluster`].

pub mod client;
pub mod kube_client;
pub mod memory;
pub mod ownership;

pub use client::{Cluster, ObjectClient};

use crate::openapp::util::error::BoxError;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum ClusterError {
    NotFound { kind: String, name: String },
    AlreadyExists { kind: String, name: String },
    Conflict(String),
    Invalid(String),
    Api(BoxError),
    Serialization(serde_json::Error),
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::NotFound { kind, name } => write!(f, "{} '{}' not found", kind, name),
            ClusterError::AlreadyExists { kind, name } => {
                write!(f, "{} '{}' already exists", kind, name)
            }
            ClusterError::Conflict(msg) | ClusterError::Invalid(msg) => f.write_str(msg),
            ClusterError::Api(err) => write!(f, "{}", err),
            ClusterError::Serialization(err) => write!(f, "serialization failed: {}", err),
        }
    }
}

impl Error for ClusterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClusterError::Api(err) => Some(err.as_ref()),
            ClusterError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err)
    }
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

/// Change notification produced by [`ObjectClient::watch`]. A (re)list is
/// framed by `InitStarted` and `InitDone`; consumers rebuild their view from
/// the `InitApplied` objects in between.
#[derive(Clone, Debug)]
pub enum ObjectEvent<K> {
    Applied(K),
    Deleted(K),
    InitStarted,
    InitApplied(K),
    InitDone,
}
