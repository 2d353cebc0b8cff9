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

//! Background task runner for informer loops, controller workers, delayed
//! re-queues and periodic sync timers.

use futures_util::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

type Job = Arc<dyn Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static>;

/// Returned by a job run; only periodic tasks look at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone, Debug)]
pub enum ScheduleSpec {
    Immediate {
        label: &'static str,
    },
    After {
        label: &'static str,
        delay: Duration,
    },
    /// Runs every `period`, first after one full period, until the job
    /// returns [`JobResult::Stop`] or the task is cancelled.
    Every {
        label: &'static str,
        period: Duration,
    },
}

impl ScheduleSpec {
    fn label(&self) -> &'static str {
        match self {
            ScheduleSpec::Immediate { label }
            | ScheduleSpec::After { label, .. }
            | ScheduleSpec::Every { label, .. } => label,
        }
    }

    fn first_delay(&self) -> Duration {
        match self {
            ScheduleSpec::Immediate { .. } => Duration::ZERO,
            ScheduleSpec::After { delay, .. } => *delay,
            ScheduleSpec::Every { period, .. } => *period,
        }
    }

    fn period(&self) -> Option<Duration> {
        match self {
            ScheduleSpec::Every { period, .. } => Some(*period),
            _ => None,
        }
    }
}

/// Handed to every run of a job.
#[derive(Clone)]
pub struct ScheduleContext {
    task: u64,
    label: &'static str,
    run: u64,
    cancellation: CancellationToken,
}

impl ScheduleContext {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn task_id(&self) -> u64 {
        self.task
    }

    /// Zero-based count of earlier runs of the same task.
    pub fn run(&self) -> u64 {
        self.run
    }
}

#[derive(Clone)]
pub struct Scheduler {
    next_task: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                next_task: Arc::new(AtomicU64::new(1)),
            })
            .clone()
    }

    pub fn schedule<F>(&self, spec: ScheduleSpec, job: F) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        self.schedule_with_token(spec, CancellationToken::new(), job)
    }

    /// Like [`Scheduler::schedule`], but the task also stops when `parent`
    /// is cancelled.
    pub fn schedule_with_token<F>(
        &self,
        spec: ScheduleSpec,
        parent: CancellationToken,
        job: F,
    ) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        let task = self.next_task.fetch_add(1, Ordering::Relaxed);
        let cancellation = parent.child_token();
        let join = tokio::spawn(drive(task, spec, cancellation.clone(), Arc::new(job)));
        ScheduledTaskHandle {
            cancellation,
            join: Mutex::new(Some(join)),
        }
    }
}

async fn drive(task: u64, spec: ScheduleSpec, cancellation: CancellationToken, job: Job) {
    let first = spec.first_delay();
    if !first.is_zero() {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = time::sleep(first) => {}
        }
    }

    let mut ticker = spec.period().map(|period| {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    let mut run = 0;
    loop {
        if cancellation.is_cancelled() {
            return;
        }
        let ctx = ScheduleContext {
            task,
            label: spec.label(),
            run,
            cancellation: cancellation.clone(),
        };
        let outcome = AssertUnwindSafe((*job)(ctx)).catch_unwind().await;
        let result = outcome.unwrap_or_else(|_| {
            log::error!("Task {} ({}) panicked; stopping task", task, spec.label());
            JobResult::Stop
        });
        run += 1;

        if result == JobResult::Stop {
            return;
        }
        let Some(interval) = ticker.as_mut() else {
            return;
        };
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = interval.tick() => {}
        }
    }
}

/// Cancels, aborts or awaits a scheduled task.
pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTaskHandle {
    fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn abort(&self) {
        if let Some(join) = self.take_join() {
            join.abort();
        }
    }

    /// Waits for the task to finish. Returns immediately if already joined.
    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        match self.take_join() {
            Some(join) => join.await,
            None => Ok(()),
        }
    }
}
