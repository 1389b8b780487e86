use std::{pin::pin, sync::Arc};

use dash0_operator_apis::{DATASET_DEFAULT, Dash0OperatorConfiguration};
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    WatchStreamExt,
    reflector::{reflector, store::Writer},
    watcher,
};
use log::{info, warn};

use crate::{api_config::ApiConfig, crd_presence::ApiClient};

/// Derives the API config from the operator configuration resources in the cluster. There
/// is expected to be at most one; if there are more, the most recently created one wins.
pub(crate) fn current_api_config(
    configurations: &[Arc<Dash0OperatorConfiguration>],
) -> Option<ApiConfig> {
    let mut candidates: Vec<&Arc<Dash0OperatorConfiguration>> = configurations
        .iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .collect();
    if candidates.len() > 1 {
        warn!(
            "found {} Dash0 operator configuration resources, using the most recent one",
            candidates.len()
        );
    }
    candidates.sort_by_key(|c| c.creation_timestamp());
    let latest = candidates.last()?;
    let endpoint = latest.api_endpoint()?;
    Some(ApiConfig {
        endpoint: endpoint.to_string(),
        dataset: latest.dataset().unwrap_or(DATASET_DEFAULT).to_string(),
    })
}

/// Watches `Dash0OperatorConfiguration` resources and forwards API config changes to all
/// registered [`ApiClient`]s.
pub(crate) struct OperatorConfigurationWatcher {
    client: Client,
    api_clients: Vec<Arc<dyn ApiClient>>,
}

impl OperatorConfigurationWatcher {
    pub(crate) fn new(client: Client, api_clients: Vec<Arc<dyn ApiClient>>) -> Self {
        Self {
            client,
            api_clients,
        }
    }

    pub(crate) async fn run(self) {
        let writer: Writer<Dash0OperatorConfiguration> = Default::default();
        let cache = writer.as_reader();
        let api = Api::<Dash0OperatorConfiguration>::all(self.client.clone());
        let events = reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        );
        let mut events = pin!(events);
        let mut applied: Option<ApiConfig> = None;
        while let Some(event) = events.next().await {
            match event {
                // wait for the complete list before acting on it
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitApply(_)) => (),
                Ok(_) => {
                    let current = current_api_config(&cache.state());
                    self.apply(current, &mut applied).await;
                }
                Err(e) => warn!("watching Dash0 operator configuration resources failed: {}", e),
            }
        }
    }

    async fn apply(&self, current: Option<ApiConfig>, applied: &mut Option<ApiConfig>) {
        if current == *applied {
            return;
        }
        match &current {
            Some(api_config) => {
                info!(
                    "using the Dash0 API endpoint {} and dataset {}",
                    api_config.endpoint, api_config.dataset
                );
                for api_client in &self.api_clients {
                    api_client
                        .set_api_endpoint_and_dataset(api_config.clone())
                        .await;
                }
            }
            None => {
                info!("no Dash0 API endpoint is configured");
                for api_client in &self.api_clients {
                    api_client.remove_api_endpoint_and_dataset().await;
                }
            }
        }
        *applied = current;
    }
}
