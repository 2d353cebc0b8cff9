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

//! Wires informers, work queues and workers for every controller.
//!
//! Each controller owns one [`WorkQueue`] drained by a single worker, so a
//! key is never reconciled concurrently. Informer events are routed to the
//! queues by small mapping functions; the template and registry queues are
//! additionally fed by a periodic timer.

use crate::openapp::api::{AppInstance, AppTemplate, PublicServiceInstance, PublicServiceTemplate};
use crate::openapp::config::ControllerSettings;
use crate::openapp::controller::appinstance::{self, app_instance_controller};
use crate::openapp::controller::instance::needs_reconcile;
use crate::openapp::controller::link::LinkController;
use crate::openapp::controller::publicserviceinstance::{
    self, public_service_instance_controller, released_public_services,
};
use crate::openapp::controller::queue::{run_worker, WorkQueue};
use crate::openapp::controller::reconcile::Reconciler;
use crate::openapp::controller::registry::{
    is_refresh_trigger, RegistryController, RegistrySource,
};
use crate::openapp::controller::status::{owner_keys, ReadinessController};
use crate::openapp::controller::template_sync::{is_sync_trigger, TemplateSyncController};
use crate::openapp::controller::watch::{Informer, ObjectKey, WatchEvent};
use crate::openapp::k8s::Cluster;
use crate::openapp::logger::{log_info, log_warn};
use crate::openapp::observability::health::HealthRegistry;
use crate::openapp::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use crate::openapp::template::TemplateRegistry;
use crate::openapp::util::error::BoxError;
use crate::openapp::util::net::{
    InterfaceAddressResolver, LocalAddressResolver, StaticAddressResolver,
};
use futures_util::future::BoxFuture;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::Resource;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller-runtime";

pub const APP_READINESS_CONTROLLER: &str = "appinstance-status-controller";
pub const PUBLIC_SERVICE_READINESS_CONTROLLER: &str = "publicserviceinstance-status-controller";
pub const APP_LINK_CONTROLLER: &str = "appinstance-link-controller";
pub const PUBLIC_SERVICE_LINK_CONTROLLER: &str = "publicserviceinstance-link-controller";
pub const APP_TEMPLATE_SYNC_CONTROLLER: &str = "apptemplate-controller";
pub const PUBLIC_SERVICE_TEMPLATE_SYNC_CONTROLLER: &str = "publicservicetemplate-controller";
pub const REGISTRY_CONTROLLER: &str = "registry-controller";

/// Builds and starts the full controller set against one cluster.
pub struct ControllerRuntime {
    cluster: Cluster,
    settings: Arc<ControllerSettings>,
    registry_source: Arc<dyn RegistrySource>,
    resolver: Arc<dyn LocalAddressResolver>,
    health: HealthRegistry,
}

/// Handle over the started controllers.
pub struct RunningControllers {
    token: CancellationToken,
    tasks: Vec<ScheduledTaskHandle>,
}

impl RunningControllers {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels every task and waits for in-flight reconciles to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in &self.tasks {
            let _ = task.join().await;
        }
        log_info(COMPONENT, "Controllers stopped", &[]);
    }
}

struct Informers {
    app_instances: Informer<AppInstance>,
    public_service_instances: Informer<PublicServiceInstance>,
    services: Informer<Service>,
    stateful_sets: Informer<StatefulSet>,
    config_maps: Informer<ConfigMap>,
}

impl Informers {
    fn new(cluster: &Cluster, settings: &ControllerSettings, health: &HealthRegistry) -> Self {
        let instances = Some(settings.instance_namespace.as_str());
        Self {
            app_instances: Informer::new(cluster.app_instances.clone(), instances, health.clone()),
            public_service_instances: Informer::new(
                cluster.public_service_instances.clone(),
                instances,
                health.clone(),
            ),
            services: Informer::new(cluster.services.clone(), instances, health.clone()),
            stateful_sets: Informer::new(cluster.stateful_sets.clone(), instances, health.clone()),
            config_maps: Informer::new(
                cluster.config_maps.clone(),
                Some(settings.system_namespace.as_str()),
                health.clone(),
            ),
        }
    }

    fn start(&self, token: &CancellationToken) -> Vec<ScheduledTaskHandle> {
        vec![
            self.app_instances.start(token.clone()),
            self.public_service_instances.start(token.clone()),
            self.services.start(token.clone()),
            self.stateful_sets.start(token.clone()),
            self.config_maps.start(token.clone()),
        ]
    }

    async fn wait_synced(&self) {
        self.app_instances.wait_synced().await;
        self.public_service_instances.wait_synced().await;
        self.services.wait_synced().await;
        self.stateful_sets.wait_synced().await;
        self.config_maps.wait_synced().await;
    }
}

impl ControllerRuntime {
    /// The node address comes from `settings.node_address` when set and is
    /// discovered from the host interfaces otherwise.
    pub fn new(
        cluster: Cluster,
        settings: Arc<ControllerSettings>,
        registry_source: Arc<dyn RegistrySource>,
        health: HealthRegistry,
    ) -> Self {
        let resolver: Arc<dyn LocalAddressResolver> = match settings.node_address.as_deref() {
            Some(address) => Arc::new(StaticAddressResolver::new(address)),
            None => Arc::new(InterfaceAddressResolver),
        };
        Self {
            cluster,
            settings,
            registry_source,
            resolver,
            health,
        }
    }

    pub fn with_address_resolver(mut self, resolver: Arc<dyn LocalAddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Starts informers, event routing, workers and timers, then waits for
    /// the informer caches to fill. Everything stops when `token` fires.
    pub async fn start(&self, token: CancellationToken) -> RunningControllers {
        let settings = &self.settings;
        let labels = &settings.labels;
        let informers = Informers::new(&self.cluster, settings, &self.health);
        let mut wiring = Wiring {
            token: token.clone(),
            tasks: Vec::new(),
            settings: Arc::clone(settings),
        };

        let app_queue = wiring.queue();
        wiring.route(&informers.app_instances, &app_queue, reconcile_keys);
        wiring.work(
            appinstance::CONTROLLER_NAME,
            &app_queue,
            reconcile_with(app_instance_controller(
                self.cluster.clone(),
                Arc::clone(settings),
            )),
        );

        let public_service_queue = wiring.queue();
        wiring.route(
            &informers.public_service_instances,
            &public_service_queue,
            reconcile_keys,
        );
        wiring.route(
            &informers.app_instances,
            &public_service_queue,
            released_public_services,
        );
        wiring.work(
            publicserviceinstance::CONTROLLER_NAME,
            &public_service_queue,
            reconcile_with(public_service_instance_controller(
                self.cluster.clone(),
                Arc::clone(settings),
            )),
        );

        let app_label = labels.app_instance.clone();
        let public_service_label = labels.publicservice_instance.clone();

        let app_readiness = wiring.queue();
        wiring.route(&informers.app_instances, &app_readiness, added_keys);
        wiring.route(&informers.stateful_sets, &app_readiness, {
            let label = app_label.clone();
            move |event: &WatchEvent<StatefulSet>| owner_keys(event, &label)
        });
        wiring.work(
            APP_READINESS_CONTROLLER,
            &app_readiness,
            reconcile_with(ReadinessController::<AppInstance>::new(
                APP_READINESS_CONTROLLER,
                &self.cluster,
                &app_label,
            )),
        );

        let public_service_readiness = wiring.queue();
        wiring.route(
            &informers.public_service_instances,
            &public_service_readiness,
            added_keys,
        );
        wiring.route(&informers.stateful_sets, &public_service_readiness, {
            let label = public_service_label.clone();
            move |event: &WatchEvent<StatefulSet>| owner_keys(event, &label)
        });
        wiring.work(
            PUBLIC_SERVICE_READINESS_CONTROLLER,
            &public_service_readiness,
            reconcile_with(ReadinessController::<PublicServiceInstance>::new(
                PUBLIC_SERVICE_READINESS_CONTROLLER,
                &self.cluster,
                &public_service_label,
            )),
        );

        let app_links = wiring.queue();
        wiring.route(&informers.app_instances, &app_links, added_keys);
        wiring.route(&informers.services, &app_links, {
            let label = app_label.clone();
            move |event: &WatchEvent<Service>| owner_keys(event, &label)
        });
        wiring.work(
            APP_LINK_CONTROLLER,
            &app_links,
            reconcile_with(LinkController::<AppInstance>::new(
                APP_LINK_CONTROLLER,
                self.cluster.clone(),
                &app_label,
                Arc::clone(&self.resolver),
            )),
        );

        let public_service_links = wiring.queue();
        wiring.route(
            &informers.public_service_instances,
            &public_service_links,
            added_keys,
        );
        wiring.route(&informers.services, &public_service_links, {
            let label = public_service_label.clone();
            move |event: &WatchEvent<Service>| owner_keys(event, &label)
        });
        wiring.work(
            PUBLIC_SERVICE_LINK_CONTROLLER,
            &public_service_links,
            reconcile_with(LinkController::<PublicServiceInstance>::new(
                PUBLIC_SERVICE_LINK_CONTROLLER,
                self.cluster.clone(),
                &public_service_label,
                Arc::clone(&self.resolver),
            )),
        );

        let system_key = ObjectKey::new(
            Some(settings.system_namespace.as_str()),
            &settings.system_configmap,
        );
        let registry = TemplateRegistry::new(&settings.registry_root);

        let app_templates = wiring.system_queue(&informers.config_maps, &system_key, is_sync_trigger);
        let controller = Arc::new(TemplateSyncController::<AppTemplate>::new(
            APP_TEMPLATE_SYNC_CONTROLLER,
            &self.cluster,
            registry.clone(),
        ));
        wiring.work(APP_TEMPLATE_SYNC_CONTROLLER, &app_templates, move |_| {
            let controller = Arc::clone(&controller);
            async move { controller.sync().await.map(drop).map_err(BoxError::from) }
        });

        let public_service_templates =
            wiring.system_queue(&informers.config_maps, &system_key, is_sync_trigger);
        let controller = Arc::new(TemplateSyncController::<PublicServiceTemplate>::new(
            PUBLIC_SERVICE_TEMPLATE_SYNC_CONTROLLER,
            &self.cluster,
            registry,
        ));
        wiring.work(
            PUBLIC_SERVICE_TEMPLATE_SYNC_CONTROLLER,
            &public_service_templates,
            move |_| {
                let controller = Arc::clone(&controller);
                async move { controller.sync().await.map(drop).map_err(BoxError::from) }
            },
        );

        let registries = wiring.system_queue(&informers.config_maps, &system_key, is_refresh_trigger);
        let controller = Arc::new(RegistryController::new(
            self.cluster.config_maps.clone(),
            Arc::clone(&self.registry_source),
            Arc::clone(settings),
        ));
        wiring.work(REGISTRY_CONTROLLER, &registries, move |_| {
            let controller = Arc::clone(&controller);
            async move { controller.refresh().await.map_err(BoxError::from) }
        });

        wiring.tasks.extend(informers.start(&token));
        tokio::select! {
            _ = token.cancelled() => {}
            _ = informers.wait_synced() => {
                log_info(COMPONENT, "Informer caches synced; controllers running", &[]);
            }
        }

        RunningControllers {
            token,
            tasks: wiring.tasks,
        }
    }
}

struct Wiring {
    token: CancellationToken,
    tasks: Vec<ScheduledTaskHandle>,
    settings: Arc<ControllerSettings>,
}

impl Wiring {
    fn queue(&self) -> WorkQueue<ObjectKey> {
        WorkQueue::new(self.settings.queue_base_delay, self.settings.queue_max_delay)
    }

    /// Feeds `queue` with the keys `map` derives from each informer event.
    /// Once the cache has synced, every cached object is routed as if it had
    /// just been added; a lagging subscriber is resynced the same way.
    fn route<K, F>(&mut self, informer: &Informer<K>, queue: &WorkQueue<ObjectKey>, map: F)
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
        F: Fn(&WatchEvent<K>) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        let informer = informer.clone();
        let queue = queue.clone();
        let map = Arc::new(map);
        let handle = Scheduler::global().schedule_with_token(
            ScheduleSpec::Immediate {
                label: "controller.route",
            },
            self.token.clone(),
            move |ctx| {
                let informer = informer.clone();
                let queue = queue.clone();
                let map = Arc::clone(&map);
                Box::pin(async move {
                    let cancel = ctx.cancellation_token();
                    let mut events = informer.subscribe();
                    tokio::select! {
                        _ = cancel.cancelled() => return JobResult::Stop,
                        _ = informer.wait_synced() => {}
                    }
                    resync(&informer, &queue, map.as_ref()).await;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            event = events.recv() => match event {
                                Ok(event) => {
                                    for key in (map.as_ref())(&event) {
                                        queue.add(key);
                                    }
                                }
                                Err(RecvError::Lagged(skipped)) => {
                                    let skipped = skipped.to_string();
                                    log_warn(
                                        COMPONENT,
                                        "Event subscriber lagged; resyncing from cache",
                                        &[
                                            ("informer", informer.name()),
                                            ("skipped", skipped.as_str()),
                                        ],
                                    );
                                    resync(&informer, &queue, map.as_ref()).await;
                                }
                                Err(RecvError::Closed) => break,
                            },
                        }
                    }
                    JobResult::Stop
                })
            },
        );
        self.tasks.push(handle);
    }

    /// Queue keyed by the system ConfigMap, fed by `trigger` and by the
    /// periodic sync timer. The key is also queued once at startup.
    fn system_queue<F>(
        &mut self,
        config_maps: &Informer<ConfigMap>,
        system_key: &ObjectKey,
        trigger: F,
    ) -> WorkQueue<ObjectKey>
    where
        F: Fn(&WatchEvent<ConfigMap>, &str, &str) -> bool + Send + Sync + 'static,
    {
        let queue = self.queue();
        let key = system_key.clone();
        let namespace = self.settings.system_namespace.clone();
        let name = self.settings.system_configmap.clone();
        self.route(config_maps, &queue, move |event: &WatchEvent<ConfigMap>| {
            if trigger(event, &namespace, &name) {
                vec![key.clone()]
            } else {
                Vec::new()
            }
        });

        let timer_queue = queue.clone();
        let key = system_key.clone();
        let handle = Scheduler::global().schedule_with_token(
            ScheduleSpec::Every {
                label: "controller.sync-timer",
                period: self.settings.sync_interval,
            },
            self.token.clone(),
            move |_| {
                timer_queue.add(key.clone());
                Box::pin(async { JobResult::Continue })
            },
        );
        self.tasks.push(handle);
        queue.add(system_key.clone());
        queue
    }

    /// Runs the single worker for `queue`. Cancellation shuts the queue
    /// down and lets the in-flight key finish.
    fn work<F, Fut>(&mut self, controller: &'static str, queue: &WorkQueue<ObjectKey>, handler: F)
    where
        F: Fn(ObjectKey) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let queue = queue.clone();
        let handle = Scheduler::global().schedule_with_token(
            ScheduleSpec::Immediate {
                label: "controller.worker",
            },
            self.token.clone(),
            move |ctx| {
                let queue = queue.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let cancel = ctx.cancellation_token();
                    let worker = run_worker(queue.clone(), controller, handler);
                    tokio::pin!(worker);
                    tokio::select! {
                        _ = worker.as_mut() => {}
                        _ = cancel.cancelled() => {
                            queue.shut_down();
                            worker.await;
                        }
                    }
                    JobResult::Stop
                })
            },
        );
        log_info(COMPONENT, "Started controller", &[("controller", controller)]);
        self.tasks.push(handle);
    }
}

async fn resync<K, F>(informer: &Informer<K>, queue: &WorkQueue<ObjectKey>, map: &F)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    F: Fn(&WatchEvent<K>) -> Vec<ObjectKey>,
{
    for object in informer.list().await {
        for key in map(&WatchEvent::Added(object)) {
            queue.add(key);
        }
    }
}

fn reconcile_with<R>(
    reconciler: R,
) -> impl Fn(ObjectKey) -> BoxFuture<'static, Result<(), BoxError>> + Clone + Send + Sync + 'static
where
    R: Reconciler + 'static,
{
    let reconciler = Arc::new(reconciler);
    move |key| {
        let reconciler = Arc::clone(&reconciler);
        Box::pin(async move {
            reconciler
                .reconcile_and_apply(&key)
                .await
                .map_err(BoxError::from)
        })
    }
}

fn object_key<K: Resource>(object: &K) -> Vec<ObjectKey> {
    ObjectKey::from_object(object).into_iter().collect()
}

fn reconcile_keys<K: Resource>(event: &WatchEvent<K>) -> Vec<ObjectKey> {
    if needs_reconcile(event) {
        object_key(event.object())
    } else {
        Vec::new()
    }
}

fn added_keys<K: Resource>(event: &WatchEvent<K>) -> Vec<ObjectKey> {
    match event {
        WatchEvent::Added(object) => object_key(object),
        _ => Vec::new(),
    }
}
