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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static WORKQUEUE_RETRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORKQUEUE_DEPTH: OnceLock<IntGaugeVec> = OnceLock::new();
static DERIVED_RESOURCE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TEMPLATE_SYNC_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("openapp".to_string()), None)
            .expect("failed to initialise openapp metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register openapp metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution for a single reconcile pass",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn workqueue_retries_total() -> &'static IntCounterVec {
    WORKQUEUE_RETRIES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "retries_total",
            "Work keys re-queued with backoff after a failed reconcile",
        )
        .subsystem("workqueue");
        let counter = IntCounterVec::new(opts, &["controller"])
            .expect("failed to build workqueue retry counter");
        register_collector(counter)
    })
}

fn workqueue_depth() -> &'static IntGaugeVec {
    WORKQUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("depth", "Work keys waiting to be processed").subsystem("workqueue");
        let gauge =
            IntGaugeVec::new(opts, &["controller"]).expect("failed to build workqueue depth gauge");
        register_collector(gauge)
    })
}

fn derived_resource_operations_total() -> &'static IntCounterVec {
    DERIVED_RESOURCE_OPERATIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "derived_resource_operations_total",
            "Create, update and delete calls issued for derived objects",
        );
        let counter = IntCounterVec::new(opts, &["kind", "operation", "result"])
            .expect("failed to build derived resource counter");
        register_collector(counter)
    })
}

fn template_sync_total() -> &'static IntCounterVec {
    TEMPLATE_SYNC_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "template_sync_total",
            "Template objects upserted from registry checkouts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("failed to build template sync counter");
        register_collector(counter)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DerivedOperation {
    Create,
    Update,
    Recreate,
    Delete,
}

impl DerivedOperation {
    fn as_label(self) -> &'static str {
        match self {
            DerivedOperation::Create => "create",
            DerivedOperation::Update => "update",
            DerivedOperation::Recreate => "recreate",
            DerivedOperation::Delete => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum OperationOutcome {
    Success,
    Error,
}

impl OperationOutcome {
    fn as_label(self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Error => "error",
        }
    }

    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            OperationOutcome::Success
        } else {
            OperationOutcome::Error
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn record_workqueue_retry(controller: &str) {
    workqueue_retries_total()
        .with_label_values(&[controller])
        .inc();
}

pub fn set_workqueue_depth(controller: &str, depth: usize) {
    workqueue_depth()
        .with_label_values(&[controller])
        .set(depth as i64);
}

pub fn record_derived_operation(kind: &str, operation: DerivedOperation, outcome: OperationOutcome) {
    derived_resource_operations_total()
        .with_label_values(&[kind, operation.as_label(), outcome.as_label()])
        .inc();
}

pub fn record_template_sync(kind: &str, outcome: OperationOutcome) {
    template_sync_total()
        .with_label_values(&[kind, outcome.as_label()])
        .inc();
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
