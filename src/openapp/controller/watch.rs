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

use crate::openapp::k8s::{ObjectClient, ObjectEvent};
use crate::openapp::logger::{log_info, log_warn};
use crate::openapp::observability::health::HealthRegistry;
use crate::openapp::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use futures_util::StreamExt;
use kube::Resource;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "informer";
const WATCH_BUFFER_SIZE: usize = 256;
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Namespace/name identity of an object; also the work-queue key of every
/// controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn from_object<K: Resource>(object: &K) -> Option<Self> {
        let name = object.meta().name.as_deref()?;
        Some(Self::new(object.meta().namespace.as_deref(), name))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Typed change notification delivered to controller event pumps.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The most recent state carried by the event.
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(object) | WatchEvent::Deleted(object) => object,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

/// Local mirror of one object kind, kept current from
/// [`ObjectClient::watch`] and fanned out to subscribers.
pub struct Informer<K> {
    inner: Arc<InformerInner<K>>,
}

impl<K> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct InformerInner<K> {
    name: String,
    client: Arc<dyn ObjectClient<K>>,
    namespace: Option<String>,
    cache: RwLock<HashMap<ObjectKey, K>>,
    sender: broadcast::Sender<WatchEvent<K>>,
    synced: watch::Sender<bool>,
    health: HealthRegistry,
}

fn same_version<K: Resource>(left: &K, right: &K) -> bool {
    let left = left.meta().resource_version.as_deref();
    left.is_some() && left == right.meta().resource_version.as_deref()
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// `namespace` limits a namespaced kind to one namespace; `None` watches
    /// every namespace (or the cluster scope).
    pub fn new(
        client: Arc<dyn ObjectClient<K>>,
        namespace: Option<&str>,
        health: HealthRegistry,
    ) -> Self {
        let name = match namespace {
            Some(ns) => format!("informer/{}/{}", K::kind(&()), ns),
            None => format!("informer/{}", K::kind(&())),
        };
        health.register(&name);
        let (sender, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(InformerInner {
                name,
                client,
                namespace: namespace.map(str::to_string),
                cache: RwLock::new(HashMap::new()),
                sender,
                synced,
                health,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.inner.sender.subscribe()
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<K> {
        self.inner.cache.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<K> {
        self.inner.cache.read().await.values().cloned().collect()
    }

    pub async fn list_matching(&self, predicate: impl Fn(&K) -> bool) -> Vec<K> {
        self.inner
            .cache
            .read()
            .await
            .values()
            .filter(|object| predicate(object))
            .cloned()
            .collect()
    }

    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Resolves once the first full list has been loaded.
    pub async fn wait_synced(&self) {
        let mut receiver = self.inner.synced.subscribe();
        let _ = receiver.wait_for(|synced| *synced).await;
    }

    /// Spawns the watch loop. It stops when `token` is cancelled.
    pub fn start(&self, token: CancellationToken) -> ScheduledTaskHandle {
        let inner = Arc::clone(&self.inner);
        Scheduler::global().schedule_with_token(
            ScheduleSpec::Immediate {
                label: "controller.informer",
            },
            token,
            move |ctx| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    run_watch_loop(inner, ctx.cancellation_token()).await;
                    JobResult::Stop
                })
            },
        )
    }
}

async fn run_watch_loop<K>(inner: Arc<InformerInner<K>>, cancel: CancellationToken)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);

    loop {
        let mut stream = inner.client.watch(inner.namespace.as_deref());
        let mut relist: Option<HashMap<ObjectKey, K>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        inner.apply(event, &mut relist).await;
                    }
                    Some(Err(err)) => {
                        let error_text = err.to_string();
                        inner.health.mark_failed(&inner.name, &error_text);
                        log_warn(
                            COMPONENT,
                            "Watch stream reported an error",
                            &[("informer", inner.name.as_str()), ("error", error_text.as_str())],
                        );
                    }
                    None => break,
                },
            }
        }

        let delay_ms = backoff.as_millis().to_string();
        log_info(
            COMPONENT,
            "Watch stream ended; restarting",
            &[("informer", inner.name.as_str()), ("delay_ms", delay_ms.as_str())],
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_MAX_MS));
    }
}

impl<K> InformerInner<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn apply(&self, event: ObjectEvent<K>, relist: &mut Option<HashMap<ObjectKey, K>>) {
        match event {
            ObjectEvent::InitStarted => {
                *relist = Some(HashMap::new());
            }
            ObjectEvent::InitApplied(object) => match (relist.as_mut(), ObjectKey::from_object(&object)) {
                (Some(pending), Some(key)) => {
                    pending.insert(key, object);
                }
                (None, Some(_)) => self.upsert(object).await,
                _ => {}
            },
            ObjectEvent::InitDone => {
                let listed = relist.take().unwrap_or_default();
                self.replace_all(listed).await;
                self.synced.send_replace(true);
                self.health.mark_ready(&self.name);
            }
            ObjectEvent::Applied(object) => self.upsert(object).await,
            ObjectEvent::Deleted(object) => {
                let Some(key) = ObjectKey::from_object(&object) else {
                    return;
                };
                self.cache.write().await.remove(&key);
                let _ = self.sender.send(WatchEvent::Deleted(object));
            }
        }
    }

    async fn upsert(&self, object: K) {
        let Some(key) = ObjectKey::from_object(&object) else {
            return;
        };
        let previous = self.cache.write().await.insert(key, object.clone());
        let event = match previous {
            None => WatchEvent::Added(object),
            Some(old) if same_version(&old, &object) => return,
            Some(old) => WatchEvent::Updated { old, new: object },
        };
        let _ = self.sender.send(event);
    }

    /// Swaps in a fresh list, emitting the differences so deletes missed
    /// while disconnected still reach subscribers.
    async fn replace_all(&self, listed: HashMap<ObjectKey, K>) {
        let mut events = Vec::new();
        {
            let mut cache = self.cache.write().await;
            for (key, object) in listed.iter() {
                match cache.get(key) {
                    None => events.push(WatchEvent::Added(object.clone())),
                    Some(old) if same_version(old, object) => {}
                    Some(old) => events.push(WatchEvent::Updated {
                        old: old.clone(),
                        new: object.clone(),
                    }),
                }
            }
            for (key, object) in cache.iter() {
                if !listed.contains_key(key) {
                    events.push(WatchEvent::Deleted(object.clone()));
                }
            }
            *cache = listed;
        }
        for event in events {
            let _ = self.sender.send(event);
        }
    }
}
