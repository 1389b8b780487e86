//! Fixtures shared by the unit tests: a mocked Kubernetes API, a local stand-in for the
//! Dash0 API and a minimal third-party kind.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use dash0_operator_apis::{Dash0Monitoring, Dash0MonitoringSpec, SynchronizationResult};
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::AUTHORIZATION,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
};
use kube::{
    Client,
    api::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta},
    client::Body,
};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_test::mock::{self, SendResponse};

use crate::{
    errors::ControllerError,
    resource_watch::{ReadyHandle, SubController, SubControllerFactory},
    synchronization::SynchronizationPreconditions,
    third_party::{
        ApiAction, HttpRequestWithItemName, MappingResult, ThirdPartyKind, api_url,
        new_api_request,
    },
};

pub(crate) type ApiServerHandle = mock::Handle<http::Request<Body>, http::Response<Body>>;

pub(crate) fn mock_client() -> (Client, ApiServerHandle) {
    let (service, handle) = mock::pair::<http::Request<Body>, http::Response<Body>>();
    (Client::new(service, "default"), handle)
}

/// Waits for the next request to the Kubernetes API and checks method and path.
pub(crate) async fn expect_request(
    handle: &mut ApiServerHandle,
    method: http::Method,
    path: &str,
) -> (http::Request<Body>, SendResponse<http::Response<Body>>) {
    let (request, send) = tokio::time::timeout(Duration::from_secs(5), handle.next_request())
        .await
        .expect("timed out waiting for a request")
        .expect("the client has been dropped");
    assert_eq!(method, request.method());
    assert_eq!(path, request.uri().path());
    (request, send)
}

pub(crate) fn json_response(status: u16, value: &Value) -> http::Response<Body> {
    http::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(value).unwrap()))
        .unwrap()
}

pub(crate) fn kube_error_response(code: u16, reason: &str) -> http::Response<Body> {
    json_response(
        code,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code
        }),
    )
}

pub(crate) fn list_response(items: &[Dash0Monitoring]) -> http::Response<Body> {
    json_response(
        200,
        &json!({
            "apiVersion": "operator.dash0.com/v1alpha1",
            "kind": "Dash0MonitoringList",
            "metadata": {"resourceVersion": "1"},
            "items": items
        }),
    )
}

pub(crate) async fn read_json(request: http::Request<Body>) -> Value {
    let bytes = request.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub(crate) fn monitoring_resource(namespace: &str, spec: Option<Dash0MonitoringSpec>) -> Dash0Monitoring {
    Dash0Monitoring {
        metadata: ObjectMeta {
            name: Some("dash0-monitoring".to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            uid: Some("6b8d7c52-7f4b-4a0e-9a55-0c1f0b1e2d3c".to_string()),
            ..Default::default()
        },
        spec: spec.unwrap_or(Dash0MonitoringSpec {
            synchronize_perses_dashboards: None,
            synchronize_prometheus_rules: None,
        }),
        status: None,
    }
}

/// An instance of [`TestKind`] with the given items.
pub(crate) fn test_resource(namespace: &str, name: &str, items: &[&str]) -> DynamicObject {
    DynamicObject::new(name, &TestKind::default().api_resource())
        .within(namespace)
        .data(json!({"spec": {"items": items}}))
}

pub(crate) fn test_crd() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some("testresources.test.dash0.com".to_string()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: "test.dash0.com".to_string(),
            names: CustomResourceDefinitionNames {
                kind: "TestResource".to_string(),
                plural: "testresources".to_string(),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            ..Default::default()
        },
        status: None,
    }
}

pub(crate) fn preconditions(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    data: Value,
) -> SynchronizationPreconditions {
    let (group, version) = api_version.split_once('/').unwrap();
    let api_resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
    SynchronizationPreconditions {
        third_party_resource: DynamicObject::new(name, &api_resource)
            .within(namespace)
            .data(data),
        monitoring_resource: monitoring_resource(namespace, None),
        auth_token: "token".to_string(),
        api_endpoint: "https://api.dash0.com".to_string(),
        dataset: "default".to_string(),
        k8s_namespace: namespace.to_string(),
        k8s_name: name.to_string(),
    }
}

/// Maps every entry of `spec.items` to one request, entries starting with `invalid` are
/// validation issues. Results are written to the dashboard section of the status.
pub(crate) struct TestKind {
    pub enabled: bool,
}

impl Default for TestKind {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ThirdPartyKind for TestKind {
    fn group(&self) -> &'static str {
        "test.dash0.com"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    fn kind(&self) -> &'static str {
        "TestResource"
    }

    fn plural(&self) -> &'static str {
        "testresources"
    }

    fn kind_display_name(&self) -> &'static str {
        "test resource"
    }

    fn short_name(&self) -> &'static str {
        "item"
    }

    fn http_retry_delay(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn is_synchronization_enabled(&self, _monitoring: &Dash0Monitoring) -> bool {
        self.enabled
    }

    fn map_resource_to_http_requests(
        &self,
        p: &SynchronizationPreconditions,
        action: ApiAction,
    ) -> MappingResult {
        let mut result = MappingResult::default();
        let items = p.third_party_resource.data["spec"]["items"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for item in items {
            let item = item.as_str().unwrap_or_default().to_string();
            result.items_total += 1;
            if item.starts_with("invalid") {
                result
                    .validation_issues
                    .insert(item, vec!["invalid item".to_string()]);
                continue;
            }
            let url = api_url(&p.api_endpoint, &["api", "test", &item], &p.dataset).unwrap();
            let request = match action {
                ApiAction::Upsert => {
                    new_api_request(Method::PUT, url, &p.auth_token, Some(&json!({"item": item})))
                }
                ApiAction::Delete => new_api_request(Method::DELETE, url, &p.auth_token, None),
            }
            .unwrap();
            result.requests.push(HttpRequestWithItemName {
                item_name: item,
                request,
            });
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

/// Counts created sub-controllers, each of which runs until it is cancelled.
#[derive(Default)]
pub(crate) struct CountingFactory {
    pub created: AtomicU32,
    pub fail_immediately: AtomicBool,
}

impl SubControllerFactory for CountingFactory {
    fn create(
        &self,
        _instance_name: &str,
        token: CancellationToken,
        ready: ReadyHandle,
    ) -> Result<SubController, ControllerError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_immediately.load(Ordering::SeqCst);
        Ok(Box::pin(async move {
            if fail {
                return Err(ControllerError::SubControllerStart(
                    "initial listing failed".to_string(),
                ));
            }
            ready.mark_running().await;
            token.cancelled().await;
            Ok(())
        }))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub body: String,
}

/// Local HTTP server standing in for the Dash0 API. Every request is recorded and answered
/// with the status code `respond` returns for it.
pub(crate) struct MockDash0Api {
    pub endpoint: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    server: JoinHandle<()>,
}

impl MockDash0Api {
    pub(crate) async fn start<F>(respond: F) -> Self
    where
        F: Fn(&RecordedRequest) -> u16 + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let respond = Arc::new(respond);
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let respond = respond.clone();
                let service = service_fn(move |request: Request<Incoming>| {
                    let recorded = recorded.clone();
                    let respond = respond.clone();
                    async move {
                        let (parts, body) = request.into_parts();
                        let body = body.collect().await?.to_bytes();
                        let request = RecordedRequest {
                            method: parts.method.to_string(),
                            path: parts.uri.path().to_string(),
                            query: parts.uri.query().unwrap_or_default().to_string(),
                            authorization: parts
                                .headers
                                .get(AUTHORIZATION)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string),
                            body: String::from_utf8_lossy(&body).to_string(),
                        };
                        let status = respond(&request);
                        recorded.lock().unwrap().push(request);
                        let mut response = Response::new(Full::new(Bytes::from_static(b"{}")));
                        *response.status_mut() = StatusCode::from_u16(status).unwrap();
                        Ok::<_, hyper::Error>(response)
                    }
                });
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        Self {
            endpoint,
            requests,
            server,
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockDash0Api {
    fn drop(&mut self) {
        self.server.abort();
    }
}
