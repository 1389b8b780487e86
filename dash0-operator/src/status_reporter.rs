use std::{sync::Arc, time::Duration};

use dash0_operator_apis::{Dash0Monitoring, SynchronizationResult};
use kube::{Api, Client, ResourceExt, api::PostParams};
use log::{debug, error, info, warn};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
    self_monitoring::SelfMonitoring,
    third_party::ThirdPartyKind,
    utils::{Backoff, retry_on_error},
};

/// A monitoring resource that is gone will not come back within the retry window.
fn is_worth_retrying(e: &ControllerError) -> bool {
    !matches!(e, ControllerError::KubeApi(e) if e.is_not_found())
}

/// Writes synchronization results to the status of `Dash0Monitoring` resources.
///
/// The monitoring resource is fetched again right before every write and the result is
/// merged into the latest version, so concurrent writers (other kinds, the monitoring
/// controller) do not lose each other's updates. Failed writes, including conflicts, are
/// retried. A result that cannot be written is dropped; the items synchronized to
/// Dash0 stay synchronized.
pub(crate) struct StatusReporter {
    client: Client,
    backoff: Backoff,
    metrics: Arc<SelfMonitoring>,
}

impl StatusReporter {
    pub(crate) fn new(client: Client, metrics: Arc<SelfMonitoring>) -> Self {
        Self {
            client,
            backoff: Backoff::new(3, Duration::from_secs(1), 1.3),
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) async fn write_synchronization_result(
        &self,
        kind: &dyn ThirdPartyKind,
        monitoring: &Dash0Monitoring,
        qualified_name: &str,
        result: SynchronizationResult,
    ) {
        let namespace = monitoring.namespace().unwrap_or_default();
        let name = monitoring.name_any();
        let api: Api<Dash0Monitoring> = Api::namespaced(self.client.clone(), namespace.as_str());
        let written = retry_on_error(
            self.backoff,
            is_worth_retrying,
            || self.write_once(&api, name.as_str(), kind, qualified_name, &result),
        )
        .await;
        match written {
            Ok(()) => info!(
                "successfully updated the Dash0 monitoring resource {} with the synchronization results for {} {}: {}",
                monitoring.id(),
                kind.kind_display_name(),
                qualified_name,
                result.synchronization_status
            ),
            Err(e) => {
                error!(
                    "finally failed (no more retries) to update the Dash0 monitoring resource {} with the synchronization results for {} {}: {:?}: {}",
                    monitoring.id(),
                    kind.kind_display_name(),
                    qualified_name,
                    result,
                    e
                );
                self.metrics.status_update_failure(kind.kind());
            }
        }
    }

    async fn write_once(
        &self,
        api: &Api<Dash0Monitoring>,
        name: &str,
        kind: &dyn ThirdPartyKind,
        qualified_name: &str,
        result: &SynchronizationResult,
    ) -> Result<(), ControllerError> {
        let mut latest = api.get_status(name).await.map_err(|e| {
            warn!(
                "failed attempt (might be retried) to fetch the Dash0 monitoring resource {} before updating it with the synchronization results for {} {}: {}",
                name,
                kind.kind_display_name(),
                qualified_name,
                e
            );
            e
        })?;
        kind.update_synchronization_results_in_status(&mut latest, qualified_name, result.clone());
        let pp = PostParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };
        api.replace_status(name, &pp, serde_json::to_vec(&latest)?)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    debug!(
                        "the Dash0 monitoring resource {} has been modified concurrently, retrying with the latest version",
                        name
                    );
                    return e;
                }
                warn!(
                    "failed attempt (might be retried) to update the Dash0 monitoring resource {} with the synchronization results for {} {}: {}",
                    name,
                    kind.kind_display_name(),
                    qualified_name,
                    e
                );
                e
            })?;
        Ok(())
    }
}
