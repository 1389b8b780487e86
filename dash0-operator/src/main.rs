#[macro_use]
extern crate log;

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use anyhow::{Context, anyhow};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

mod api_config;
mod crd_presence;
mod errors;
mod operator_configuration;
mod perses_dashboards;
mod prometheus_exporter;
mod prometheus_rules;
mod resource_watch;
mod self_monitoring;
mod status_reporter;
mod synchronization;
#[cfg(test)]
mod test_support;
mod third_party;
mod utils;

use api_config::ApiConfigStore;
use crd_presence::{ApiClient, ThirdPartyCrdWatcher};
use operator_configuration::OperatorConfigurationWatcher;
use perses_dashboards::PersesDashboards;
use prometheus_exporter::start_prometheus_metrics_server;
use prometheus_rules::PrometheusRules;
use resource_watch::{ResourceWatchLifecycle, ThirdPartyResourceWatch};
use self_monitoring::SelfMonitoring;
use synchronization::SynchronizationEngine;
use third_party::ThirdPartyKind;

/// The K8s field manager name.
const MANAGER: &str = "dash0-operator";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn http_retry_delay() -> anyhow::Result<Option<Duration>> {
    env_var("DASH0_HTTP_RETRY_DELAY_MS")
        .map(|v| v.parse::<u64>().map(Duration::from_millis))
        .transpose()
        .context("DASH0_HTTP_RETRY_DELAY_MS must be a number of milliseconds")
}

/// The UID of the `kube-system` namespace identifies the cluster in the origin of
/// everything the operator creates in Dash0.
async fn pseudo_cluster_uid(client: &Client) -> anyhow::Result<String> {
    let namespace = Api::<Namespace>::all(client.clone())
        .get("kube-system")
        .await
        .context("unable to get the kube-system namespace uid")?;
    namespace
        .metadata
        .uid
        .ok_or_else(|| anyhow!("the kube-system namespace has no uid"))
}

/// Wires the components that synchronize one third-party kind.
fn third_party_crd_watcher(
    kind: Arc<dyn ThirdPartyKind>,
    client: &Client,
    http_client: &reqwest::Client,
    auth_token: &Option<String>,
    metrics: &Arc<SelfMonitoring>,
) -> Arc<ThirdPartyCrdWatcher> {
    let api_config = ApiConfigStore::default();
    let crd_exists = Arc::new(AtomicBool::new(false));
    let engine = Arc::new(SynchronizationEngine::new(
        kind.clone(),
        client.clone(),
        http_client.clone(),
        api_config.clone(),
        auth_token.clone(),
        metrics.clone(),
    ));
    let resource_watch = Arc::new(ThirdPartyResourceWatch::new(
        client.clone(),
        kind.clone(),
        engine,
    ));
    let lifecycle = Arc::new(ResourceWatchLifecycle::new(
        kind.clone(),
        crd_exists.clone(),
        api_config.clone(),
        resource_watch,
    ));
    Arc::new(ThirdPartyCrdWatcher::new(
        kind,
        client.clone(),
        crd_exists,
        lifecycle,
        api_config,
        auth_token.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a TLS crypto provider has already been installed");
    }
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr: SocketAddr = format!("{}:{}", metrics_addr, metrics_port).parse()?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics = Arc::new(SelfMonitoring::new(&global::meter(MANAGER)));
    let metrics_server = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let auth_token = env_var("DASH0_AUTH_TOKEN");
    let http_retry_delay = http_retry_delay()?;
    let cluster_uid = match auth_token {
        Some(_) => pseudo_cluster_uid(&client).await?,
        None => String::new(),
    };
    let http_client = reqwest::Client::builder().build()?;

    let kinds: Vec<Arc<dyn ThirdPartyKind>> = vec![
        Arc::new(PersesDashboards::new(cluster_uid.clone(), http_retry_delay)),
        Arc::new(PrometheusRules::new(cluster_uid, http_retry_delay)),
    ];
    let crd_watchers: Vec<Arc<ThirdPartyCrdWatcher>> = kinds
        .into_iter()
        .map(|kind| third_party_crd_watcher(kind, &client, &http_client, &auth_token, &metrics))
        .collect();
    let mut crd_watches = Vec::new();
    for crd_watcher in &crd_watchers {
        if crd_watcher.setup().await {
            debug!(
                "watching the {} custom resource definition",
                crd_watcher.kind().qualified_kind()
            );
            crd_watches.push(tokio::spawn(crd_watcher.clone().run()));
        }
    }
    let api_clients: Vec<Arc<dyn ApiClient>> = crd_watchers
        .iter()
        .map(|crd_watcher| crd_watcher.clone() as Arc<dyn ApiClient>)
        .collect();
    let configuration_watcher = OperatorConfigurationWatcher::new(client, api_clients).run();

    info!("start controllers ...");
    tokio::select! {
        _ = configuration_watcher => (),
        result = metrics_server => result?,
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
    };
    // no CRD event may start a sub-controller once the lifecycles are shutting down
    for crd_watch in &crd_watches {
        crd_watch.abort();
    }
    for crd_watcher in &crd_watchers {
        crd_watcher.lifecycle().shutdown().await;
    }
    if let Err(e) = meter_provider.shutdown() {
        warn!("unable to shut down the meter provider: {}", e);
    }
    Ok(())
}
