use std::{
    collections::HashMap,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{Stream, StreamExt, future::BoxFuture};
use kube::{Api, Client, api::DynamicObject};
use kube_runtime::{WatchStreamExt, watcher};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    api_config::{ApiConfigStore, is_valid_api_config},
    errors::ControllerError,
    third_party::ThirdPartyKind,
    utils::NamespacedName,
};

/// Number of consecutive watch errors tolerated before the initial listing of instances
/// has completed. A sub-controller exceeding it gives up.
const MAX_INITIAL_WATCH_ERRORS: u32 = 5;

/// Receives the instances of a third-party kind as they are created, updated and deleted.
#[async_trait]
pub(crate) trait InstanceEventHandler: Send + Sync {
    async fn upsert(&self, resource: &DynamicObject);
    async fn delete(&self, resource: &DynamicObject);
}

/// The running part of a sub-controller. Resolves when the sub-controller has stopped.
pub(crate) type SubController = BoxFuture<'static, Result<(), ControllerError>>;

pub(crate) trait SubControllerFactory: Send + Sync {
    /// Creates a sub-controller that stops once `token` is cancelled and reports through
    /// `ready` when it has finished its initial listing.
    fn create(
        &self,
        instance_name: &str,
        token: CancellationToken,
        ready: ReadyHandle,
    ) -> Result<SubController, ControllerError>;
}

#[derive(Debug)]
enum WatchState {
    Stopped,
    Starting {
        generation: u64,
        token: CancellationToken,
    },
    Running {
        generation: u64,
        token: CancellationToken,
    },
}

#[derive(Debug)]
struct Lifecycle {
    state: WatchState,
    generation: u64,
}

impl Lifecycle {
    fn current_generation(&self) -> Option<u64> {
        match &self.state {
            WatchState::Stopped => None,
            WatchState::Starting { generation, .. } | WatchState::Running { generation, .. } => {
                Some(*generation)
            }
        }
    }
}

/// Lets a sub-controller move its own lifecycle state. Transitions only apply while the
/// state still belongs to the generation the handle was created for, so a sub-controller
/// that has been replaced in the meantime cannot modify the state of its successor.
#[derive(Clone)]
pub(crate) struct ReadyHandle {
    lifecycle: Arc<Mutex<Lifecycle>>,
    generation: u64,
}

impl ReadyHandle {
    pub(crate) async fn mark_running(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let WatchState::Starting { generation, token } = &lifecycle.state {
            if *generation == self.generation {
                let token = token.clone();
                lifecycle.state = WatchState::Running {
                    generation: self.generation,
                    token,
                };
            }
        }
    }

    async fn mark_stopped(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.current_generation() == Some(self.generation) {
            lifecycle.state = WatchState::Stopped;
        }
    }
}

/// Starts and stops the sub-controller watching the instances of one third-party kind.
///
/// A sub-controller is started once the CRD exists and a valid API config is available,
/// and there is never more than one sub-controller per kind. The lock only guards the
/// start/stop decision, it is never held while instance events are processed.
pub(crate) struct ResourceWatchLifecycle {
    kind: Arc<dyn ThirdPartyKind>,
    crd_exists: Arc<AtomicBool>,
    api_config: ApiConfigStore,
    factory: Arc<dyn SubControllerFactory>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    tasks: TaskTracker,
}

impl ResourceWatchLifecycle {
    pub(crate) fn new(
        kind: Arc<dyn ThirdPartyKind>,
        crd_exists: Arc<AtomicBool>,
        api_config: ApiConfigStore,
        factory: Arc<dyn SubControllerFactory>,
    ) -> Self {
        Self {
            kind,
            crd_exists,
            api_config,
            factory,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: WatchState::Stopped,
                generation: 0,
            })),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) async fn maybe_start(&self, is_startup: bool) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.tasks.is_closed() {
            debug!(
                "not starting the controller {}, the operator is shutting down",
                self.kind.controller_name()
            );
            return;
        }
        if lifecycle.current_generation().is_some() {
            debug!(
                "the controller {} is already running",
                self.kind.controller_name()
            );
            return;
        }
        if !self.crd_exists.load(Ordering::SeqCst) {
            info!(
                "The {} custom resource definition does not exist in this cluster, the operator will not watch for {} resources.",
                self.kind.qualified_kind(),
                self.kind.kind_display_name()
            );
            return;
        }
        let api_config = self.api_config.load();
        if !is_valid_api_config(api_config.as_deref()) {
            if !is_startup {
                info!(
                    "The {} custom resource definition is present in this cluster, but no Dash0 API endpoint has been provided via the operator configuration resource. The operator will not watch for {} resources.",
                    self.kind.qualified_kind(),
                    self.kind.kind_display_name()
                );
            }
            return;
        }

        info!(
            "The {} custom resource definition is present in this cluster, and a Dash0 API endpoint has been provided. The operator will watch for {} resources.",
            self.kind.qualified_kind(),
            self.kind.kind_display_name()
        );
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let instance_name = format!("{}#{}", self.kind.controller_name(), generation);
        let token = CancellationToken::new();
        let ready = ReadyHandle {
            lifecycle: self.lifecycle.clone(),
            generation,
        };
        let sub_controller = match self
            .factory
            .create(instance_name.as_str(), token.clone(), ready.clone())
        {
            Ok(sub_controller) => sub_controller,
            Err(e) => {
                error!("cannot create a new {}: {}", instance_name, e);
                return;
            }
        };
        info!("successfully created a new {}", instance_name);
        lifecycle.state = WatchState::Starting { generation, token };
        self.tasks.spawn(async move {
            match sub_controller.await {
                Ok(()) => info!("the controller {} has been stopped", instance_name),
                Err(e) => error!("unable to start the controller {}: {}", instance_name, e),
            }
            ready.mark_stopped().await;
        });
    }

    pub(crate) async fn maybe_stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let token = match std::mem::replace(&mut lifecycle.state, WatchState::Stopped) {
            WatchState::Stopped => {
                debug!(
                    "ignoring attempt to stop the controller {} which seems to be stopped already",
                    self.kind.controller_name()
                );
                return;
            }
            WatchState::Starting { token, .. } | WatchState::Running { token, .. } => token,
        };
        info!(
            "removing the watch for {} resources and stopping the controller {} now",
            self.kind.kind_display_name(),
            self.kind.controller_name()
        );
        token.cancel();
    }

    /// Stops the sub-controller and waits until every sub-controller task has returned.
    pub(crate) async fn shutdown(&self) {
        self.maybe_stop().await;
        self.tasks.close();
        self.tasks.wait().await;
    }

    #[cfg(test)]
    pub(crate) async fn is_watching(&self) -> bool {
        self.lifecycle.lock().await.current_generation().is_some()
    }

    #[cfg(test)]
    async fn is_running(&self) -> bool {
        matches!(
            self.lifecycle.lock().await.state,
            WatchState::Running { .. }
        )
    }
}

/// Watches all instances of a third-party kind and hands them to an [`InstanceEventHandler`].
pub(crate) struct ThirdPartyResourceWatch {
    client: Client,
    kind: Arc<dyn ThirdPartyKind>,
    handler: Arc<dyn InstanceEventHandler>,
}

impl ThirdPartyResourceWatch {
    pub(crate) fn new(
        client: Client,
        kind: Arc<dyn ThirdPartyKind>,
        handler: Arc<dyn InstanceEventHandler>,
    ) -> Self {
        Self {
            client,
            kind,
            handler,
        }
    }
}

impl SubControllerFactory for ThirdPartyResourceWatch {
    fn create(
        &self,
        instance_name: &str,
        token: CancellationToken,
        ready: ReadyHandle,
    ) -> Result<SubController, ControllerError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.kind.api_resource());
        let events = watcher(api, watcher::Config::default()).default_backoff();
        Ok(Box::pin(dispatch_events(
            instance_name.to_string(),
            events,
            token,
            self.handler.clone(),
            ready,
        )))
    }
}

/// Delivers watch events to `handler` one at a time until `token` is cancelled.
///
/// Cancellation is only checked between events, an event that is being handled when the
/// token is cancelled is handled completely. Instances that disappear while the watch is
/// re-listing are delivered as deletions.
pub(crate) async fn dispatch_events<S>(
    instance_name: String,
    events: S,
    token: CancellationToken,
    handler: Arc<dyn InstanceEventHandler>,
    ready: ReadyHandle,
) -> Result<(), ControllerError>
where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>> + Send,
{
    let mut events = pin!(events);
    let mut known: HashMap<NamespacedName, DynamicObject> = HashMap::new();
    let mut relisted: HashMap<NamespacedName, DynamicObject> = HashMap::new();
    let mut initialized = false;
    let mut initial_errors = 0u32;
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            None => break,
            Some(Ok(watcher::Event::Init)) => relisted.clear(),
            Some(Ok(watcher::Event::InitApply(o))) => {
                handler.upsert(&o).await;
                relisted.insert(NamespacedName::from(&o), o);
            }
            Some(Ok(watcher::Event::InitDone)) => {
                for (id, o) in known.drain() {
                    if !relisted.contains_key(&id) {
                        debug!("{} disappeared while re-listing", id);
                        handler.delete(&o).await;
                    }
                }
                std::mem::swap(&mut known, &mut relisted);
                if !initialized {
                    initialized = true;
                    info!("the controller {} has finished its initial listing", instance_name);
                    ready.mark_running().await;
                }
            }
            Some(Ok(watcher::Event::Apply(o))) => {
                handler.upsert(&o).await;
                known.insert(NamespacedName::from(&o), o);
            }
            Some(Ok(watcher::Event::Delete(o))) => {
                known.remove(&NamespacedName::from(&o));
                handler.delete(&o).await;
            }
            Some(Err(e)) if !initialized => {
                initial_errors += 1;
                if initial_errors >= MAX_INITIAL_WATCH_ERRORS {
                    return Err(ControllerError::SubControllerStart(format!(
                        "the initial listing failed {} times, last error: {}",
                        initial_errors, e
                    )));
                }
                warn!("{}: {}", instance_name, e);
            }
            Some(Err(e)) => warn!("{}: {}", instance_name, e),
        }
    }
    Ok(())
}
