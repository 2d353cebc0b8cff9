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

//! Rate-limited work queue feeding a controller's single worker.
//!
//! A key is held at most once in the queue. A key added while a worker is
//! processing it is parked and handed out again after [`WorkQueue::done`],
//! so two reconciles of the same key never overlap.

use crate::openapp::logger::log_warn;
use crate::openapp::observability::metrics::{
    record_controller_reconcile, record_workqueue_retry, set_workqueue_depth,
    ControllerReconcileResult,
};
use crate::openapp::observability::tracing;
use crate::openapp::scheduler::{JobResult, ScheduleSpec, Scheduler};
use crate::openapp::util::error::BoxError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay: max_delay.max(base_delay),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        Scheduler::global().schedule(
            ScheduleSpec::After {
                label: "workqueue.delayed-add",
                delay,
            },
            move |_| {
                let queue = queue.clone();
                let item = item.clone();
                Box::pin(async move {
                    queue.add(item);
                    JobResult::Stop
                })
            },
        );
    }

    /// Re-adds `item` after its per-key exponential backoff.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            self.backoff(*failures)
        };
        self.add_after(item, delay);
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.inner
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.inner.max_delay)
            .min(self.inner.max_delay)
    }

    /// Clears the backoff history of `item` only.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks `item` processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drives `handler` over every key until the queue shuts down. Failed keys
/// are re-added with backoff; successful keys have their backoff cleared.
pub async fn run_worker<T, F, Fut>(queue: WorkQueue<T>, controller: &'static str, handler: F)
where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    while let Some(item) = queue.get().await {
        set_workqueue_depth(controller, queue.len());
        let started = Instant::now();
        let key_text = item.to_string();
        let result = tracing::with_span(controller, key_text.clone(), handler(item.clone())).await;

        match result {
            Ok(()) => {
                record_controller_reconcile(
                    controller,
                    ControllerReconcileResult::Success,
                    started.elapsed(),
                );
                queue.forget(&item);
            }
            Err(err) => {
                record_controller_reconcile(
                    controller,
                    ControllerReconcileResult::Error,
                    started.elapsed(),
                );
                record_workqueue_retry(controller);
                let error_text = err.to_string();
                let retries = (queue.num_requeues(&item) + 1).to_string();
                log_warn(
                    controller,
                    "Reconcile failed; requeueing with backoff",
                    &[
                        ("key", key_text.as_str()),
                        ("retries", retries.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                queue.add_rate_limited(item.clone());
            }
        }
        queue.done(&item);
    }
}
