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

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

#[derive(Clone, Debug)]
enum ComponentState {
    Pending,
    Ready,
    Failed(String),
}

/// Shared readiness board. Informers register themselves as pending and flip
/// to ready once their cache has synced; watch failures are kept as the
/// latest error until the next successful sync.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentState>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.update(name, ComponentState::Pending);
    }

    pub fn mark_ready(&self, name: &str) {
        self.update(name, ComponentState::Ready);
    }

    pub fn mark_failed(&self, name: &str, err: impl ToString) {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        self.update(name, ComponentState::Failed(message));
    }

    fn update(&self, name: &str, state: ComponentState) {
        let mut guard = self
            .components
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(name.to_string(), state);
    }

    /// Returns a readiness assessment used by `/readyz` and `/healthz`.
    pub fn readiness_report(&self) -> HealthReport {
        let guard = self
            .components
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let components: Vec<ComponentHealth> = guard
            .iter()
            .map(|(name, state)| match state {
                ComponentState::Ready => ComponentHealth {
                    name: name.clone(),
                    healthy: true,
                    error: None,
                },
                ComponentState::Pending => ComponentHealth {
                    name: name.clone(),
                    healthy: false,
                    error: Some("cache not synced".to_string()),
                },
                ComponentState::Failed(message) => ComponentHealth {
                    name: name.clone(),
                    healthy: false,
                    error: Some(message.clone()),
                },
            })
            .collect();

        let status = if components.iter().all(|component| component.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, components }
    }
}

/// Liveness probes only check that the process answers requests.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth {
            name: "process".to_string(),
            healthy: true,
            error: None,
        }],
    }
}
