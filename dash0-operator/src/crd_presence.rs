use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use log::{error, info, warn};

use crate::{
    api_config::{ApiConfig, ApiConfigStore},
    resource_watch::ResourceWatchLifecycle,
    third_party::ThirdPartyKind,
};

/// Receives the Dash0 API settings whenever the operator configuration changes.
#[async_trait]
pub(crate) trait ApiClient: Send + Sync {
    async fn set_api_endpoint_and_dataset(&self, api_config: ApiConfig);
    async fn remove_api_endpoint_and_dataset(&self);
}

/// Tracks whether the CRD of one third-party kind exists and starts or stops the watch
/// for its instances accordingly.
pub(crate) struct ThirdPartyCrdWatcher {
    kind: Arc<dyn ThirdPartyKind>,
    client: Client,
    crd_exists: Arc<AtomicBool>,
    lifecycle: Arc<ResourceWatchLifecycle>,
    api_config: ApiConfigStore,
    auth_token: Option<String>,
}

impl ThirdPartyCrdWatcher {
    pub(crate) fn new(
        kind: Arc<dyn ThirdPartyKind>,
        client: Client,
        crd_exists: Arc<AtomicBool>,
        lifecycle: Arc<ResourceWatchLifecycle>,
        api_config: ApiConfigStore,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            kind,
            client,
            crd_exists,
            lifecycle,
            api_config,
            auth_token,
        }
    }

    pub(crate) fn kind(&self) -> &dyn ThirdPartyKind {
        self.kind.as_ref()
    }

    pub(crate) fn lifecycle(&self) -> &ResourceWatchLifecycle {
        self.lifecycle.as_ref()
    }

    fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    /// Checks once whether the CRD exists and, if so, tries to start watching instances.
    /// Returns `false` if the kind is not watched at all because there is no auth token.
    pub(crate) async fn setup(&self) -> bool {
        if self.auth_token.as_deref().map_or(true, str::is_empty) {
            info!(
                "No Dash0 auth token has been provided. The operator will not watch for {} resources.",
                self.kind.kind_display_name()
            );
            return false;
        }
        let name = self.kind.qualified_kind();
        match self.crds().get_opt(name.as_str()).await {
            Ok(Some(crd)) if self.is_matching_crd(&crd) => {
                self.crd_exists.store(true, Ordering::SeqCst);
                self.lifecycle.maybe_start(true).await;
            }
            Ok(_) => info!(
                "The {} custom resource definition does not exist in this cluster, the operator will not watch for {} resources.",
                name,
                self.kind.kind_display_name()
            ),
            Err(e) => error!(
                "unable to get the {} custom resource definition: {}",
                name, e
            ),
        }
        true
    }

    /// Watches the CRD until the stream ends, which it only does when the process stops.
    pub(crate) async fn run(self: Arc<Self>) {
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.kind.qualified_kind()));
        let mut events = watcher(self.crds(), config).default_backoff().boxed();
        let mut seen_while_relisting = false;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle_event(event, &mut seen_while_relisting).await,
                Err(e) => warn!(
                    "watching the {} custom resource definition failed: {}",
                    self.kind.qualified_kind(),
                    e
                ),
            }
        }
    }

    fn is_matching_crd(&self, crd: &CustomResourceDefinition) -> bool {
        crd.spec.group == self.kind.group() && crd.spec.names.kind == self.kind.kind()
    }

    /// A matching CRD that is applied while it is not known to exist has been created,
    /// applying a known CRD is an update and ignored. A CRD that was known to exist but is
    /// missing from a complete re-list has been deleted while the watch was interrupted.
    pub(crate) async fn handle_event(
        &self,
        event: watcher::Event<CustomResourceDefinition>,
        seen_while_relisting: &mut bool,
    ) {
        match event {
            watcher::Event::Init => *seen_while_relisting = false,
            watcher::Event::InitApply(crd) if self.is_matching_crd(&crd) => {
                *seen_while_relisting = true;
                self.crd_applied(&crd).await;
            }
            watcher::Event::Apply(crd) if self.is_matching_crd(&crd) => self.crd_applied(&crd).await,
            watcher::Event::Delete(crd) if self.is_matching_crd(&crd) => {
                self.crd_deleted(crd.name_any().as_str()).await
            }
            watcher::Event::InitDone if !*seen_while_relisting => {
                if self.crd_exists.load(Ordering::SeqCst) {
                    self.crd_deleted(self.kind.qualified_kind().as_str()).await;
                }
            }
            _ => (),
        }
    }

    async fn crd_applied(&self, crd: &CustomResourceDefinition) {
        if crd.metadata.deletion_timestamp.is_some() {
            return;
        }
        if !self.crd_exists.swap(true, Ordering::SeqCst) {
            info!(
                "The {} custom resource definition has been created.",
                crd.name_any()
            );
            self.lifecycle.maybe_start(false).await;
        }
    }

    async fn crd_deleted(&self, name: &str) {
        info!("The {} custom resource definition has been deleted.", name);
        self.crd_exists.store(false, Ordering::SeqCst);
        self.lifecycle.maybe_stop().await;
    }
}

#[async_trait]
impl ApiClient for ThirdPartyCrdWatcher {
    async fn set_api_endpoint_and_dataset(&self, api_config: ApiConfig) {
        self.api_config.store(Some(api_config));
        self.lifecycle.maybe_start(false).await;
    }

    async fn remove_api_endpoint_and_dataset(&self) {
        self.api_config.store(None);
        self.lifecycle.maybe_stop().await;
    }
}
