use std::collections::BTreeMap;

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Dataset used when the operator configuration does not name one.
pub const DATASET_DEFAULT: &'static str = "default";

/// Per namespace monitoring settings. Besides configuring which third-party resources
/// of the namespace are synchronized to Dash0, the resource also records the outcome of
/// the most recent synchronization of each of those resources in its status.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.dash0.com",
    version = "v1alpha1",
    kind = "Dash0Monitoring",
    derive = "PartialEq",
    status = "Dash0MonitoringStatus",
    namespaced,
    printcolumn = r#"{
        "name":"SynchronizePersesDashboards",
        "type": "boolean",
        "jsonPath": ".spec.synchronizePersesDashboards",
        "description": "Whether Perses dashboards in this namespace are synchronized to Dash0."
    }"#,
    printcolumn = r#"{
        "name":"SynchronizePrometheusRules",
        "type": "boolean",
        "jsonPath": ".spec.synchronizePrometheusRules",
        "description": "Whether Prometheus alerting rules in this namespace are synchronized to Dash0."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct Dash0MonitoringSpec {
    /// Synchronize `PersesDashboard` resources of this namespace to Dash0, defaults to `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronize_perses_dashboards: Option<bool>,
    /// Synchronize alerting rules from `PrometheusRule` resources of this namespace to Dash0,
    /// defaults to `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronize_prometheus_rules: Option<bool>,
}

/// Outcome of synchronizing one third-party resource.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum SynchronizationStatus {
    /// All items of the resource have been synchronized.
    Successful,
    /// Some items have been synchronized, others had validation issues or errors.
    PartiallySuccessful,
    /// No item has been synchronized.
    Failed,
}

impl std::fmt::Display for SynchronizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SynchronizationStatus::Successful => "Successful",
            SynchronizationStatus::PartiallySuccessful => "PartiallySuccessful",
            SynchronizationStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The latest synchronization result for one third-party resource.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationResult {
    pub synchronization_status: SynchronizationStatus,
    /// RFC 3339 timestamp of the synchronization attempt.
    pub synchronized_at: String,
    /// Number of eligible items (dashboards, rules, ...) found in the resource.
    pub items_total: u32,
    /// Names of the items that have been synchronized successfully.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub succeeded: Vec<String>,
    /// Items which could not be converted, with the reasons why.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validation_issues: BTreeMap<String, Vec<String>>,
    /// Items for which the synchronization failed, with the error message.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub synchronization_errors: BTreeMap<String, String>,
}

impl SynchronizationResult {
    pub fn new(
        synchronization_status: SynchronizationStatus,
        items_total: u32,
        succeeded: Vec<String>,
        validation_issues: BTreeMap<String, Vec<String>>,
        synchronization_errors: BTreeMap<String, String>,
    ) -> Self {
        Self {
            synchronization_status,
            synchronized_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            items_total,
            succeeded,
            validation_issues,
            synchronization_errors,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dash0MonitoringStatus {
    /// Synchronization results for `PersesDashboard` resources, keyed by `namespace/name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perses_dashboard_synchronization_results: Option<BTreeMap<String, SynchronizationResult>>,
    /// Synchronization results for `PrometheusRule` resources, keyed by `namespace/name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_rule_synchronization_results: Option<BTreeMap<String, SynchronizationResult>>,
}

impl Dash0MonitoringStatus {
    pub fn update_perses_dashboard_synchronization_result(
        &mut self,
        qualified_name: &str,
        result: SynchronizationResult,
    ) {
        self.perses_dashboard_synchronization_results
            .get_or_insert_with(Default::default)
            .insert(qualified_name.to_string(), result);
    }

    pub fn update_prometheus_rule_synchronization_result(
        &mut self,
        qualified_name: &str,
        result: SynchronizationResult,
    ) {
        self.prometheus_rule_synchronization_results
            .get_or_insert_with(Default::default)
            .insert(qualified_name.to_string(), result);
    }
}

impl Dash0Monitoring {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_perses_dashboard_synchronization_enabled(&self) -> bool {
        self.spec.synchronize_perses_dashboards.unwrap_or(true)
    }

    pub fn is_prometheus_rule_synchronization_enabled(&self) -> bool {
        self.spec.synchronize_prometheus_rules.unwrap_or(true)
    }

    pub fn status_mut(&mut self) -> &mut Dash0MonitoringStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Cluster wide operator settings. Only the API connection settings are relevant for the
/// synchronization of third-party resources.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.dash0.com",
    version = "v1alpha1",
    kind = "Dash0OperatorConfiguration",
    derive = "PartialEq",
    printcolumn = r#"{
        "name":"ApiEndpoint",
        "type": "string",
        "jsonPath": ".spec.export.dash0.apiEndpoint",
        "description": "The Dash0 API endpoint third-party resources are synchronized to."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct Dash0OperatorConfigurationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct Export {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash0: Option<Dash0Configuration>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dash0Configuration {
    /// Base URL of the Dash0 API, e.g. `https://api.eu-west-1.aws.dash0.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    /// The dataset to synchronize to, defaults to `default`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl Dash0OperatorConfiguration {
    fn dash0(&self) -> Option<&Dash0Configuration> {
        self.spec.export.as_ref().and_then(|e| e.dash0.as_ref())
    }

    /// The configured API endpoint, `None` if unset or blank.
    pub fn api_endpoint(&self) -> Option<&str> {
        self.dash0()
            .and_then(|d| d.api_endpoint.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The configured dataset, `None` if unset or blank.
    pub fn dataset(&self) -> Option<&str> {
        self.dash0()
            .and_then(|d| d.dataset.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn monitoring(spec: Dash0MonitoringSpec) -> Dash0Monitoring {
        Dash0Monitoring {
            metadata: ObjectMeta {
                name: Some("dash0-monitoring".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn it_works() {
        let p = Dash0MonitoringSpec {
            synchronize_perses_dashboards: Some(false),
            synchronize_prometheus_rules: None,
        };
        assert_eq!(
            r#"{"synchronizePersesDashboards":false}"#,
            serde_json::to_string(&p).unwrap()
        );
    }

    #[test]
    fn synchronization_is_enabled_by_default() {
        let m = monitoring(Dash0MonitoringSpec {
            synchronize_perses_dashboards: None,
            synchronize_prometheus_rules: Some(false),
        });
        assert!(m.is_perses_dashboard_synchronization_enabled());
        assert!(!m.is_prometheus_rule_synchronization_enabled());
        assert_eq!("team-a/dash0-monitoring", m.id());
    }

    #[test]
    fn status_sections_are_independent() {
        let mut m = monitoring(Dash0MonitoringSpec {
            synchronize_perses_dashboards: None,
            synchronize_prometheus_rules: None,
        });
        let result = SynchronizationResult::new(
            SynchronizationStatus::Successful,
            1,
            vec!["dashboard".to_string()],
            Default::default(),
            Default::default(),
        );
        m.status_mut()
            .update_perses_dashboard_synchronization_result("team-a/d1", result.clone());
        m.status_mut()
            .update_perses_dashboard_synchronization_result("team-a/d1", result.clone());
        let status = m.status.as_ref().unwrap();
        assert_eq!(
            1,
            status
                .perses_dashboard_synchronization_results
                .as_ref()
                .unwrap()
                .len()
        );
        assert!(status.prometheus_rule_synchronization_results.is_none());
    }

    #[test]
    fn synchronization_result_serialization() {
        let mut errors = BTreeMap::new();
        errors.insert("g/HighLatency".to_string(), "boom".to_string());
        let result = SynchronizationResult::new(
            SynchronizationStatus::PartiallySuccessful,
            2,
            vec!["g/HighErrorRate".to_string()],
            Default::default(),
            errors,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!("PartiallySuccessful", json["synchronizationStatus"]);
        assert_eq!(2, json["itemsTotal"]);
        assert_eq!("boom", json["synchronizationErrors"]["g/HighLatency"]);
        assert!(json.get("validationIssues").is_none());
        assert!(json["synchronizedAt"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn operator_configuration_api_endpoint() {
        let mut config = Dash0OperatorConfiguration::new(
            "dash0-operator-configuration",
            Dash0OperatorConfigurationSpec {
                export: Some(Export {
                    dash0: Some(Dash0Configuration {
                        api_endpoint: Some(" https://api.dash0.com ".to_string()),
                        dataset: Some("".to_string()),
                    }),
                }),
            },
        );
        assert_eq!(Some("https://api.dash0.com"), config.api_endpoint());
        assert_eq!(None, config.dataset());
        config.spec.export = None;
        assert_eq!(None, config.api_endpoint());
    }
}
