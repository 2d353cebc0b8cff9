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


//! Span identifiers for reconcile passes. Spans are backed by the `tracing`
//! crate; a task-local [`TraceContext`] lets the line logger attach
//! `trace_id` / `span_id` pairs to everything a reconcile logs.

use std::future::Future;
use std::sync::Once;
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

/// W3C-sized identifiers: 128-bit trace, 64-bit span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    trace: u128,
    span: u64,
}

impl TraceContext {
    fn root() -> Self {
        Self {
            trace: rand::random(),
            span: rand::random(),
        }
    }

    fn child(&self) -> Self {
        Self {
            trace: self.trace,
            span: rand::random(),
        }
    }

    pub fn trace_id(&self) -> String {
        format!("{:032x}", self.trace)
    }

    pub fn span_id(&self) -> String {
        format!("{:016x}", self.span)
    }
}

task_local! {
    static ACTIVE: TraceContext;
}

/// Installs the process-wide subscriber. Safe to call repeatedly.
pub fn init() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Another component may already own the global subscriber.
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE.try_with(|ctx| *ctx).ok()
}

/// Runs `fut` inside a span named after the controller and the object key.
/// Nested calls keep the outer trace id and mint a fresh span id.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = current_context()
        .map(|parent| parent.child())
        .unwrap_or_else(TraceContext::root);
    let name = span_name.into();
    let span = tracing::info_span!(
        "openapp",
        component,
        key = name.as_str(),
        trace_id = context.trace_id().as_str(),
        span_id = context.span_id().as_str(),
    );
    ACTIVE.scope(context, fut.instrument(span)).await
}
