use std::{collections::HashSet, time::Duration};

use dash0_operator_apis::{Dash0Monitoring, SynchronizationResult};
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    errors::ControllerError,
    synchronization::SynchronizationPreconditions,
    third_party::{
        ApiAction, HttpRequestWithItemName, MappingResult, ThirdPartyKind, api_url,
        new_api_request,
    },
    utils::path_segment,
};

const DEFAULT_HTTP_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Synchronizes the alerting rules of `PrometheusRule` resources as Dash0 check rules.
/// Every alerting rule is one item, recording rules are ignored.
pub(crate) struct PrometheusRules {
    pseudo_cluster_uid: String,
    http_retry_delay: Duration,
}

/// An alerting rule found in a `PrometheusRule` resource.
#[derive(Debug)]
struct AlertingRule<'a> {
    group: &'a str,
    interval: Option<&'a Value>,
    alert: &'a str,
    rule: &'a Map<String, Value>,
}

impl AlertingRule<'_> {
    fn item_name(&self) -> String {
        format!("{}/{}", self.group, self.alert)
    }
}

/// Splits the rule groups of a resource into alerting rules and validation issues.
fn alerting_rules<'a>(
    data: &'a Value,
    result: &mut MappingResult,
) -> Vec<AlertingRule<'a>> {
    let mut rules = Vec::new();
    let groups = match data.pointer("/spec/groups") {
        None | Some(Value::Null) => return rules,
        Some(Value::Array(groups)) => groups,
        Some(_) => {
            result.items_total += 1;
            result.validation_issues.insert(
                "spec.groups".to_string(),
                vec!["spec.groups is not a list".to_string()],
            );
            return rules;
        }
    };
    let mut seen = HashSet::new();
    for (i, group) in groups.iter().enumerate() {
        let group_name = group
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty());
        let group_name = match (group.as_object(), group_name) {
            (Some(_), Some(name)) => name,
            (Some(_), None) => {
                result.items_total += 1;
                result.validation_issues.insert(
                    format!("groups[{}]", i),
                    vec!["the rule group has no name".to_string()],
                );
                continue;
            }
            (None, _) => {
                result.items_total += 1;
                result.validation_issues.insert(
                    format!("groups[{}]", i),
                    vec!["the rule group is not a map".to_string()],
                );
                continue;
            }
        };
        let group_rules = match group.get("rules") {
            None | Some(Value::Null) => continue,
            Some(Value::Array(rules)) => rules,
            Some(_) => {
                result.items_total += 1;
                result.validation_issues.insert(
                    format!("{}/rules", group_name),
                    vec!["the rules of the group are not a list".to_string()],
                );
                continue;
            }
        };
        for (j, rule) in group_rules.iter().enumerate() {
            let rule = match rule.as_object() {
                Some(rule) => rule,
                None => {
                    result.items_total += 1;
                    result.validation_issues.insert(
                        format!("{}/rules[{}]", group_name, j),
                        vec!["the rule is not a map".to_string()],
                    );
                    continue;
                }
            };
            let alert = match rule.get("alert") {
                // recording rule
                None => continue,
                Some(alert) => alert.as_str().map(str::trim).unwrap_or(""),
            };
            result.items_total += 1;
            if alert.is_empty() {
                result.validation_issues.insert(
                    format!("{}/rules[{}]", group_name, j),
                    vec!["the alert name is empty".to_string()],
                );
                continue;
            }
            let alerting_rule = AlertingRule {
                group: group_name,
                interval: group.get("interval"),
                alert,
                rule,
            };
            if !seen.insert(alerting_rule.item_name()) {
                result.validation_issues.insert(
                    format!("{}/rules[{}]", group_name, j),
                    vec![format!("the group already contains an alert named {}", alert)],
                );
                continue;
            }
            rules.push(alerting_rule);
        }
    }
    rules
}

fn expression(rule: &Map<String, Value>) -> Option<String> {
    match rule.get("expr") {
        Some(Value::String(expr)) if !expr.trim().is_empty() => Some(expr.clone()),
        Some(Value::Number(expr)) => Some(expr.to_string()),
        _ => None,
    }
}

/// The check rule payload sent to the Dash0 API.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CheckRule<'a> {
    name: &'a str,
    expression: String,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    for_duration: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_firing_for: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<&'a Value>,
}

fn non_null<'a>(rule: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    rule.get(field).filter(|v| !v.is_null())
}

/// The check rule for an alerting rule, or the reasons why there is none.
fn check_rule<'a>(rule: &AlertingRule<'a>) -> Result<CheckRule<'a>, Vec<String>> {
    let expression = expression(rule.rule)
        .ok_or_else(|| vec!["the rule has no expression".to_string()])?;
    Ok(CheckRule {
        name: rule.alert,
        expression,
        for_duration: non_null(rule.rule, "for"),
        keep_firing_for: non_null(rule.rule, "keep_firing_for"),
        interval: rule.interval.filter(|v| !v.is_null()),
        labels: non_null(rule.rule, "labels"),
        annotations: non_null(rule.rule, "annotations"),
    })
}

impl PrometheusRules {
    pub(crate) fn new(pseudo_cluster_uid: String, http_retry_delay: Option<Duration>) -> Self {
        Self {
            pseudo_cluster_uid,
            http_retry_delay: http_retry_delay.unwrap_or(DEFAULT_HTTP_RETRY_DELAY),
        }
    }

    fn origin(&self, p: &SynchronizationPreconditions, rule: &AlertingRule) -> String {
        format!(
            "dash0-operator_{}_{}_{}_{}_{}_{}",
            self.pseudo_cluster_uid, p.dataset, p.k8s_namespace, p.k8s_name, rule.group, rule.alert
        )
    }
}

impl ThirdPartyKind for PrometheusRules {
    fn group(&self) -> &'static str {
        "monitoring.coreos.com"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    fn kind(&self) -> &'static str {
        "PrometheusRule"
    }

    fn plural(&self) -> &'static str {
        "prometheusrules"
    }

    fn kind_display_name(&self) -> &'static str {
        "Prometheus rule"
    }

    fn short_name(&self) -> &'static str {
        "check rule"
    }

    fn http_retry_delay(&self) -> Duration {
        self.http_retry_delay
    }

    fn is_synchronization_enabled(&self, monitoring: &Dash0Monitoring) -> bool {
        monitoring.is_prometheus_rule_synchronization_enabled()
    }

    fn map_resource_to_http_requests(
        &self,
        p: &SynchronizationPreconditions,
        action: ApiAction,
    ) -> MappingResult {
        let mut result = MappingResult::default();
        let rules = alerting_rules(&p.third_party_resource.data, &mut result);
        for rule in rules {
            let item_name = rule.item_name();
            let url = match api_url(
                &p.api_endpoint,
                &[
                    "api",
                    "alerting",
                    "check-rules",
                    &path_segment(&self.origin(p, &rule)),
                ],
                &p.dataset,
            ) {
                Ok(url) => url,
                Err(e) => {
                    result.synchronization_errors.insert(item_name, e.to_string());
                    continue;
                }
            };
            let request = match action {
                ApiAction::Upsert => match check_rule(&rule) {
                    Ok(payload) => serde_json::to_value(&payload)
                        .map_err(ControllerError::from)
                        .and_then(|payload| {
                            new_api_request(Method::PUT, url, &p.auth_token, Some(&payload))
                        }),
                    Err(issues) => {
                        result.validation_issues.insert(item_name, issues);
                        continue;
                    }
                },
                ApiAction::Delete => new_api_request(Method::DELETE, url, &p.auth_token, None),
            };
            match request {
                Ok(request) => result
                    .requests
                    .push(HttpRequestWithItemName { item_name, request }),
                Err(e) => {
                    result.synchronization_errors.insert(item_name, e.to_string());
                }
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
            .update_prometheus_rule_synchronization_result(qualified_name, result);
    }
}
