use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use dash0_operator_apis::{
    DATASET_DEFAULT, Dash0Monitoring, SynchronizationResult, SynchronizationStatus,
};
use kube::{
    Api, Client, ResourceExt,
    api::{DynamicObject, ListParams},
};
use log::{debug, error, info, warn};

use crate::{
    api_config::{ApiConfig, ApiConfigStore, is_valid_api_config},
    errors::ControllerError,
    resource_watch::InstanceEventHandler,
    self_monitoring::{OUTCOME_PERMANENT, OUTCOME_RETRYABLE, OUTCOME_SUCCESS, SelfMonitoring},
    status_reporter::StatusReporter,
    third_party::{ApiAction, HttpRequestWithItemName, MappingResult, ThirdPartyKind},
    utils::{Backoff, NamespacedName, retry_on_error},
};

/// Everything a [`ThirdPartyKind`] needs to map a resource to API requests.
#[derive(Clone, Debug)]
pub(crate) struct SynchronizationPreconditions {
    pub third_party_resource: DynamicObject,
    pub monitoring_resource: Dash0Monitoring,
    pub auth_token: String,
    pub api_endpoint: String,
    pub dataset: String,
    pub k8s_namespace: String,
    pub k8s_name: String,
}

#[derive(Debug)]
pub(crate) enum PreconditionValidationResult {
    /// The resource is not synchronized, the reason is logged.
    Skip(String),
    Synchronize(Box<SynchronizationPreconditions>),
}

/// The `Dash0Monitoring` resource that governs the namespace of a third-party resource.
#[derive(Debug)]
pub(crate) enum MonitoringLookup {
    Found(Dash0Monitoring),
    Missing,
}

/// There is expected to be at most one monitoring resource per namespace; if there are
/// more, the most recently created one wins. Resources being deleted are ignored.
impl From<Vec<Dash0Monitoring>> for MonitoringLookup {
    fn from(items: Vec<Dash0Monitoring>) -> Self {
        let mut candidates: Vec<Dash0Monitoring> =
            items.into_iter().filter(|m| !m.is_being_deleted()).collect();
        if candidates.len() > 1 {
            warn!(
                "found {} Dash0 monitoring resources in namespace {}, using the most recent one",
                candidates.len(),
                candidates[0].namespace().unwrap_or_default()
            );
        }
        candidates.sort_by_key(|m| m.creation_timestamp());
        match candidates.pop() {
            Some(m) => MonitoringLookup::Found(m),
            None => MonitoringLookup::Missing,
        }
    }
}

/// Decides whether `resource` can be synchronized. The checks are applied in order and
/// the first one that fails determines the reason for skipping.
pub(crate) fn evaluate_preconditions(
    kind: &dyn ThirdPartyKind,
    resource: &DynamicObject,
    monitoring: MonitoringLookup,
    api_config: Option<&ApiConfig>,
    auth_token: Option<&str>,
) -> PreconditionValidationResult {
    let id = NamespacedName::from(resource);
    let monitoring_resource = match monitoring {
        MonitoringLookup::Found(m) => m,
        MonitoringLookup::Missing => {
            return PreconditionValidationResult::Skip(format!(
                "There is no Dash0 monitoring resource in namespace {}, will not synchronize the {} resource {}.",
                id.namespace,
                kind.kind_display_name(),
                id.name
            ));
        }
    };
    if !kind.is_synchronization_enabled(&monitoring_resource) {
        return PreconditionValidationResult::Skip(format!(
            "Synchronization for {}s is disabled via the settings of the Dash0 monitoring resource in namespace {}, will not synchronize the {} resource {}.",
            kind.kind_display_name(),
            id.namespace,
            kind.kind_display_name(),
            id.name
        ));
    }
    let api_config = match api_config {
        Some(c) if is_valid_api_config(Some(c)) => c,
        _ => {
            return PreconditionValidationResult::Skip(format!(
                "No Dash0 API endpoint has been provided via the operator configuration resource, the {}(s) from {} will not be updated in Dash0.",
                kind.short_name(),
                id
            ));
        }
    };
    let auth_token = match auth_token.filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => {
            return PreconditionValidationResult::Skip(format!(
                "No auth token is set on the operator deployment, the {}(s) from {} will not be updated in Dash0.",
                kind.short_name(),
                id
            ));
        }
    };
    let dataset = if api_config.dataset.is_empty() {
        DATASET_DEFAULT.to_string()
    } else {
        api_config.dataset.clone()
    };
    PreconditionValidationResult::Synchronize(Box::new(SynchronizationPreconditions {
        third_party_resource: resource.clone(),
        monitoring_resource,
        auth_token: auth_token.to_string(),
        api_endpoint: api_config.endpoint.clone(),
        dataset,
        k8s_namespace: id.namespace,
        k8s_name: id.name,
    }))
}

/// Sends `request` to the Dash0 API, retrying transport failures and 5xx responses up to
/// three attempts in total.
pub(crate) async fn execute_single_http_request_with_retry(
    http_client: &reqwest::Client,
    kind: &dyn ThirdPartyKind,
    request: &HttpRequestWithItemName,
    action: ApiAction,
    metrics: &SelfMonitoring,
) -> Result<(), ControllerError> {
    info!(
        "{} {} \"{}\" at {} in Dash0",
        action.verb(),
        kind.short_name(),
        request.item_name,
        request.request.url()
    );
    retry_on_error(
        Backoff::new(3, kind.http_retry_delay(), 1.5),
        ControllerError::is_retryable,
        || execute_single_http_request(http_client, kind, request, action, metrics),
    )
    .await
}

async fn execute_single_http_request(
    http_client: &reqwest::Client,
    kind: &dyn ThirdPartyKind,
    request: &HttpRequestWithItemName,
    action: ApiAction,
    metrics: &SelfMonitoring,
) -> Result<(), ControllerError> {
    let url = request.request.url().to_string();
    let attempt = request.request.try_clone().ok_or_else(|| {
        ControllerError::InvalidRequest(format!(
            "the request for {} \"{}\" cannot be repeated",
            kind.short_name(),
            request.item_name
        ))
    })?;
    let response = match http_client.execute(attempt).await {
        Ok(response) => response,
        Err(e) => {
            error!(
                "unable to execute the HTTP request for {} {} \"{}\" at {}: {}",
                action.verb(),
                kind.short_name(),
                request.item_name,
                url,
                e
            );
            metrics.http_request_attempt(kind.kind(), OUTCOME_RETRYABLE);
            return Err(e.into());
        }
    };
    let status = response.status();
    if status.is_success() {
        // drain the body so the connection can be reused
        let _ = response.bytes().await;
        metrics.http_request_attempt(kind.kind(), OUTCOME_SUCCESS);
        return Ok(());
    }
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => format!("<unable to read the response body: {}>", e),
    };
    let e = ControllerError::HttpStatus {
        status: status.as_u16(),
        action: action.verb(),
        item: format!("{} \"{}\"", kind.short_name(), request.item_name),
        url,
        body,
    };
    if e.is_retryable() {
        error!("{}, request might be retried", e);
        metrics.http_request_attempt(kind.kind(), OUTCOME_RETRYABLE);
    } else {
        error!("{}", e);
        metrics.http_request_attempt(kind.kind(), OUTCOME_PERMANENT);
    }
    Err(e)
}

/// Executes all requests one after another. Returns the names of the items that have been
/// synchronized and the error message per item that could not be synchronized.
pub(crate) async fn execute_all_http_requests(
    http_client: &reqwest::Client,
    kind: &dyn ThirdPartyKind,
    requests: &[HttpRequestWithItemName],
    action: ApiAction,
    metrics: &SelfMonitoring,
) -> (Vec<String>, BTreeMap<String, String>) {
    let mut succeeded = Vec::new();
    let mut errors = BTreeMap::new();
    for request in requests {
        match execute_single_http_request_with_retry(http_client, kind, request, action, metrics)
            .await
        {
            Ok(()) => succeeded.push(request.item_name.clone()),
            Err(e) => {
                errors.insert(request.item_name.clone(), e.to_string());
            }
        }
    }
    (succeeded, errors)
}

pub(crate) fn classify(
    succeeded: usize,
    validation_issues: usize,
    synchronization_errors: usize,
) -> SynchronizationStatus {
    if succeeded > 0 && validation_issues == 0 && synchronization_errors == 0 {
        SynchronizationStatus::Successful
    } else if succeeded > 0 {
        SynchronizationStatus::PartiallySuccessful
    } else {
        SynchronizationStatus::Failed
    }
}

/// Combines the outcome of mapping and executing into one result.
///
/// Every item ends up in at most one of succeeded, validation issues and synchronization
/// errors, with errors taking precedence over validation issues and validation issues
/// taking precedence over successes. A collaborator that reports the same item in more
/// than one place is logged.
pub(crate) fn aggregate(
    kind: &dyn ThirdPartyKind,
    resource: &NamespacedName,
    items_total: u32,
    mut succeeded: Vec<String>,
    mut validation_issues: BTreeMap<String, Vec<String>>,
    mapping_errors: BTreeMap<String, String>,
    http_errors: BTreeMap<String, String>,
) -> SynchronizationResult {
    let mut synchronization_errors = mapping_errors;
    for (item, message) in http_errors {
        match synchronization_errors.get_mut(&item) {
            Some(existing) => {
                warn!(
                    "{} {}: {} \"{}\" has been reported as both a mapping error and a failed request",
                    kind.kind_display_name(),
                    resource,
                    kind.short_name(),
                    item
                );
                existing.push_str("; ");
                existing.push_str(&message);
            }
            None => {
                synchronization_errors.insert(item, message);
            }
        }
    }
    for item in synchronization_errors.keys() {
        if validation_issues.remove(item).is_some() {
            warn!(
                "{} {}: {} \"{}\" has both validation issues and synchronization errors",
                kind.kind_display_name(),
                resource,
                kind.short_name(),
                item
            );
        }
    }
    succeeded.retain(|item| {
        let failed =
            synchronization_errors.contains_key(item) || validation_issues.contains_key(item);
        if failed {
            warn!(
                "{} {}: {} \"{}\" has been reported as synchronized and as failed",
                kind.kind_display_name(),
                resource,
                kind.short_name(),
                item
            );
        }
        !failed
    });
    let status = classify(
        succeeded.len(),
        validation_issues.len(),
        synchronization_errors.len(),
    );
    SynchronizationResult::new(
        status,
        items_total,
        succeeded,
        validation_issues,
        synchronization_errors,
    )
}

/// Synchronizes the instances of one third-party kind to Dash0.
pub(crate) struct SynchronizationEngine {
    kind: Arc<dyn ThirdPartyKind>,
    client: Client,
    http_client: reqwest::Client,
    api_config: ApiConfigStore,
    auth_token: Option<String>,
    status_reporter: StatusReporter,
    metrics: Arc<SelfMonitoring>,
}

impl SynchronizationEngine {
    pub(crate) fn new(
        kind: Arc<dyn ThirdPartyKind>,
        client: Client,
        http_client: reqwest::Client,
        api_config: ApiConfigStore,
        auth_token: Option<String>,
        metrics: Arc<SelfMonitoring>,
    ) -> Self {
        let status_reporter = StatusReporter::new(client.clone(), metrics.clone());
        Self {
            kind,
            client,
            http_client,
            api_config,
            auth_token,
            status_reporter,
            metrics,
        }
    }

    async fn validate_preconditions(&self, resource: &DynamicObject) -> PreconditionValidationResult {
        let id = NamespacedName::from(resource);
        let api: Api<Dash0Monitoring> = Api::namespaced(self.client.clone(), id.namespace.as_str());
        let lookup = match api.list(&ListParams::default()).await {
            Ok(list) => MonitoringLookup::from(list.items),
            Err(e) => {
                error!(
                    "An error occurred when looking up the Dash0 monitoring resource in namespace {} while trying to synchronize the {} resource {}: {}",
                    id.namespace,
                    self.kind.kind_display_name(),
                    id.name,
                    e
                );
                return PreconditionValidationResult::Skip(format!(
                    "The Dash0 monitoring resource lookup in namespace {} failed.",
                    id.namespace
                ));
            }
        };
        let api_config = self.api_config.load();
        evaluate_preconditions(
            self.kind.as_ref(),
            resource,
            lookup,
            api_config.as_deref(),
            self.auth_token.as_deref(),
        )
    }

    async fn synchronize(&self, resource: &DynamicObject, action: ApiAction) {
        let kind = self.kind.as_ref();
        self.metrics.reconcile_request(kind.kind(), action.label());
        let started = Instant::now();
        let preconditions = match self.validate_preconditions(resource).await {
            PreconditionValidationResult::Skip(reason) => {
                info!("{}", reason);
                return;
            }
            PreconditionValidationResult::Synchronize(p) => p,
        };
        let id = NamespacedName::from(resource);
        let mapping = kind.map_resource_to_http_requests(&preconditions, action);
        if mapping.is_empty() {
            info!(
                "{} {} did not contain any {}, skipping.",
                kind.kind_display_name(),
                id,
                kind.short_name()
            );
            return;
        }
        let MappingResult {
            items_total,
            requests,
            validation_issues,
            synchronization_errors,
        } = mapping;
        let (succeeded, http_errors) = execute_all_http_requests(
            &self.http_client,
            kind,
            &requests,
            action,
            self.metrics.as_ref(),
        )
        .await;
        let result = aggregate(
            kind,
            &id,
            items_total,
            succeeded,
            validation_issues,
            synchronization_errors,
            http_errors,
        );
        info!(
            "{} {} {}: {} {}(s), {} successfully synchronized, validation issues: {:?}, synchronization errors: {:?}",
            action.label(),
            kind.kind_display_name(),
            id,
            result.items_total,
            kind.short_name(),
            result.succeeded.len(),
            result.validation_issues,
            result.synchronization_errors
        );
        self.metrics
            .synchronization_result(kind.kind(), result.synchronization_status, started.elapsed());
        self.status_reporter
            .write_synchronization_result(
                kind,
                &preconditions.monitoring_resource,
                id.to_string().as_str(),
                result,
            )
            .await;
    }
}

#[async_trait]
impl InstanceEventHandler for SynchronizationEngine {
    async fn upsert(&self, resource: &DynamicObject) {
        self.synchronize(resource, ApiAction::Upsert).await
    }

    async fn delete(&self, resource: &DynamicObject) {
        debug!(
            "{} {} has been deleted",
            self.kind.kind_display_name(),
            resource.name_any()
        );
        self.synchronize(resource, ApiAction::Delete).await
    }
}
