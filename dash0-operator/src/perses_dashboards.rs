use std::time::Duration;

use dash0_operator_apis::{Dash0Monitoring, SynchronizationResult};
use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::{
    synchronization::SynchronizationPreconditions,
    third_party::{
        ApiAction, HttpRequestWithItemName, MappingResult, ThirdPartyKind, api_url,
        new_api_request,
    },
    utils::path_segment,
};

const DEFAULT_HTTP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Synchronizes `PersesDashboard` resources, one dashboard per resource.
pub(crate) struct PersesDashboards {
    pseudo_cluster_uid: String,
    http_retry_delay: Duration,
}

impl PersesDashboards {
    pub(crate) fn new(pseudo_cluster_uid: String, http_retry_delay: Option<Duration>) -> Self {
        Self {
            pseudo_cluster_uid,
            http_retry_delay: http_retry_delay.unwrap_or(DEFAULT_HTTP_RETRY_DELAY),
        }
    }

    /// `_` cannot occur in Kubernetes names, so origins of different resources never collide.
    fn origin(&self, p: &SynchronizationPreconditions) -> String {
        format!(
            "dash0-operator_{}_{}_{}_{}",
            self.pseudo_cluster_uid, p.dataset, p.k8s_namespace, p.k8s_name
        )
    }
}

/// Returns the dashboard spec with `display.name` defaulted to `default_name`.
fn dashboard_spec(resource_data: &Value, default_name: &str) -> Result<Value, String> {
    let mut spec: Map<String, Value> = match resource_data.get("spec") {
        None | Some(Value::Null) => return Err("the dashboard has no spec".to_string()),
        Some(Value::Object(spec)) => spec.clone(),
        Some(_) => return Err("the dashboard spec is not a map".to_string()),
    };
    let display = spec
        .entry("display")
        .or_insert_with(|| Value::Object(Map::new()));
    if display.is_null() {
        *display = Value::Object(Map::new());
    }
    let display = display
        .as_object_mut()
        .ok_or_else(|| "the dashboard spec.display is not a map".to_string())?;
    let has_name = display
        .get("name")
        .and_then(Value::as_str)
        .map_or(false, |n| !n.is_empty());
    if !has_name {
        display.insert("name".to_string(), Value::String(default_name.to_string()));
    }
    Ok(Value::Object(spec))
}

fn display_name(resource_data: &Value) -> Option<&str> {
    resource_data
        .pointer("/spec/display/name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
}

impl ThirdPartyKind for PersesDashboards {
    fn group(&self) -> &'static str {
        "perses.dev"
    }

    fn version(&self) -> &'static str {
        "v1alpha1"
    }

    fn kind(&self) -> &'static str {
        "PersesDashboard"
    }

    fn plural(&self) -> &'static str {
        "persesdashboards"
    }

    fn kind_display_name(&self) -> &'static str {
        "Perses dashboard"
    }

    fn short_name(&self) -> &'static str {
        "dashboard"
    }

    fn http_retry_delay(&self) -> Duration {
        self.http_retry_delay
    }

    fn is_synchronization_enabled(&self, monitoring: &Dash0Monitoring) -> bool {
        monitoring.is_perses_dashboard_synchronization_enabled()
    }

    fn map_resource_to_http_requests(
        &self,
        p: &SynchronizationPreconditions,
        action: ApiAction,
    ) -> MappingResult {
        let data = &p.third_party_resource.data;
        let qualified_name = format!("{}/{}", p.k8s_namespace, p.k8s_name);
        let item_name = display_name(data).unwrap_or(&qualified_name).to_string();
        let mut result = MappingResult {
            items_total: 1,
            ..Default::default()
        };
        let origin = self.origin(p);
        let url = match api_url(
            &p.api_endpoint,
            &["api", "dashboards", &path_segment(&origin)],
            &p.dataset,
        ) {
            Ok(url) => url,
            Err(e) => {
                result.synchronization_errors.insert(item_name, e.to_string());
                return result;
            }
        };
        let request = match action {
            ApiAction::Upsert => match dashboard_spec(data, &qualified_name) {
                Ok(spec) => {
                    let payload = json!({"kind": "PersesDashboard", "spec": spec});
                    new_api_request(Method::PUT, url, &p.auth_token, Some(&payload))
                }
                Err(issue) => {
                    result.validation_issues.insert(item_name, vec![issue]);
                    return result;
                }
            },
            ApiAction::Delete => new_api_request(Method::DELETE, url, &p.auth_token, None),
        };
        match request {
            Ok(request) => result.requests.push(HttpRequestWithItemName { item_name, request }),
            Err(e) => {
                result.synchronization_errors.insert(item_name, e.to_string());
            }
        }
        result
    }

    fn update_synchronization_results_in_status(
        &self,
        monitoring: &mut Dash0Monitoring,
        qualified_name: &str,
        result: SynchronizationResult,
    ) {
        monitoring
            .status_mut()
            .update_perses_dashboard_synchronization_result(qualified_name, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{monitoring_resource, preconditions};

    fn kind() -> PersesDashboards {
        PersesDashboards::new("cluster-uid".to_string(), None)
    }

    fn body(request: &reqwest::Request) -> Value {
        serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn upsert_defaults_the_display_name() {
        let p = preconditions(
            "perses.dev/v1alpha1",
            "PersesDashboard",
            "team-a",
            "dashboard",
            json!({"spec": {"duration": "5m", "panels": {}}}),
        );
        let result = kind().map_resource_to_http_requests(&p, ApiAction::Upsert);
        assert_eq!(1, result.items_total);
        assert!(result.validation_issues.is_empty());
        let request = &result.requests[0];
        assert_eq!("team-a/dashboard", request.item_name);
        assert_eq!(Method::PUT, *request.request.method());
        assert_eq!(
            "https://api.dash0.com/api/dashboards/dash0-operator_cluster-uid_default_team-a_dashboard?dataset=default",
            request.request.url().as_str()
        );
        assert_eq!(
            json!({
                "kind": "PersesDashboard",
                "spec": {"duration": "5m", "panels": {}, "display": {"name": "team-a/dashboard"}}
            }),
            body(&request.request)
        );
    }

    #[test]
    fn upsert_keeps_the_display_name() {
        let p = preconditions(
            "perses.dev/v1alpha1",
            "PersesDashboard",
            "team-a",
            "dashboard",
            json!({"spec": {"display": {"name": "Checkout"}}}),
        );
        let result = kind().map_resource_to_http_requests(&p, ApiAction::Upsert);
        assert_eq!("Checkout", result.requests[0].item_name);
        assert_eq!("Checkout", body(&result.requests[0].request)["spec"]["display"]["name"]);
    }

    #[test]
    fn invalid_specs_are_validation_issues() {
        for data in [
            json!({}),
            json!({"spec": "dashboard"}),
            json!({"spec": {"display": ["x"]}}),
        ] {
            let p = preconditions(
                "perses.dev/v1alpha1",
                "PersesDashboard",
                "team-a",
                "dashboard",
                data,
            );
            let result = kind().map_resource_to_http_requests(&p, ApiAction::Upsert);
            assert_eq!(1, result.items_total);
            assert!(result.requests.is_empty());
            assert_eq!(1, result.validation_issues["team-a/dashboard"].len());
        }
    }

    #[test]
    fn delete_does_not_need_a_spec() {
        let p = preconditions(
            "perses.dev/v1alpha1",
            "PersesDashboard",
            "team-a",
            "dashboard",
            json!({}),
        );
        let result = kind().map_resource_to_http_requests(&p, ApiAction::Delete);
        assert_eq!(Method::DELETE, *result.requests[0].request.method());
        assert!(result.requests[0].request.body().is_none());
    }

    #[test]
    fn results_go_to_the_dashboard_section() {
        let mut monitoring = monitoring_resource("team-a", None);
        kind().update_synchronization_results_in_status(
            &mut monitoring,
            "team-a/dashboard",
            SynchronizationResult::new(
                dash0_operator_apis::SynchronizationStatus::Failed,
                1,
                vec![],
                Default::default(),
                Default::default(),
            ),
        );
        let status = monitoring.status.unwrap();
        assert!(status.perses_dashboard_synchronization_results.is_some());
        assert!(status.prometheus_rule_synchronization_results.is_none());
    }
}
