use std::{collections::BTreeMap, time::Duration};

use dash0_operator_apis::{Dash0Monitoring, SynchronizationResult};
use kube::api::{ApiResource, GroupVersionKind};
use reqwest::{
    Method, Request, Url,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue},
};

use crate::{errors::ControllerError, synchronization::SynchronizationPreconditions};

/// Whether the items of a third-party resource are created/updated or deleted in Dash0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ApiAction {
    Upsert,
    Delete,
}

impl ApiAction {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ApiAction::Upsert => "upsert",
            ApiAction::Delete => "delete",
        }
    }

    /// Used in log messages and errors, e.g. "updating dashboard x".
    pub(crate) fn verb(&self) -> &'static str {
        match self {
            ApiAction::Upsert => "updating",
            ApiAction::Delete => "deleting",
        }
    }
}

/// A prepared request for the Dash0 API and the name of the item it synchronizes.
#[derive(Debug)]
pub(crate) struct HttpRequestWithItemName {
    pub item_name: String,
    pub request: Request,
}

/// What a third-party resource maps to: the number of eligible items it contains, one
/// request per item that could be converted, and the reasons why the other items could
/// not be converted.
#[derive(Debug, Default)]
pub(crate) struct MappingResult {
    pub items_total: u32,
    pub requests: Vec<HttpRequestWithItemName>,
    pub validation_issues: BTreeMap<String, Vec<String>>,
    pub synchronization_errors: BTreeMap<String, String>,
}

impl MappingResult {
    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.validation_issues.is_empty()
            && self.synchronization_errors.is_empty()
    }
}

/// A kind of third-party custom resource whose instances are synchronized to Dash0.
///
/// Implementations describe the kind and translate single resources into API requests.
/// Everything else (watching the CRD, watching instances, retries, status reporting) is
/// implemented once for all kinds.
pub(crate) trait ThirdPartyKind: Send + Sync {
    fn group(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn kind(&self) -> &'static str;
    fn plural(&self) -> &'static str;

    /// Human readable name, e.g. "Perses dashboard".
    fn kind_display_name(&self) -> &'static str;

    /// What a single synchronized item is called, e.g. "dashboard".
    fn short_name(&self) -> &'static str;

    /// Name of the CustomResourceDefinition, `<plural>.<group>`.
    fn qualified_kind(&self) -> String {
        format!("{}.{}", self.plural(), self.group())
    }

    fn controller_name(&self) -> String {
        format!("dash0_{}_controller", self.plural())
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(self.group(), self.version(), self.kind()),
            self.plural(),
        )
    }

    /// Base delay between two attempts of the same request.
    fn http_retry_delay(&self) -> Duration;

    fn is_synchronization_enabled(&self, monitoring: &Dash0Monitoring) -> bool;

    /// Converts a resource into requests. Must not have side effects, failures to convert
    /// single items are reported in the result.
    fn map_resource_to_http_requests(
        &self,
        preconditions: &SynchronizationPreconditions,
        action: ApiAction,
    ) -> MappingResult;

    /// Records `result` for the resource `qualified_name` in this kind's section of the
    /// monitoring resource status.
    fn update_synchronization_results_in_status(
        &self,
        monitoring: &mut Dash0Monitoring,
        qualified_name: &str,
        result: SynchronizationResult,
    );
}

/// `<endpoint>/<segments...>?dataset=<dataset>`, every segment percent-encoded.
pub(crate) fn api_url(
    endpoint: &str,
    segments: &[&str],
    dataset: &str,
) -> Result<Url, ControllerError> {
    let mut url = Url::parse(endpoint).map_err(|e| {
        ControllerError::InvalidRequest(format!("invalid API endpoint {}: {}", endpoint, e))
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            ControllerError::InvalidRequest(format!("invalid API endpoint {}", endpoint))
        })?
        .pop_if_empty()
        .extend(segments);
    url.query_pairs_mut().clear().append_pair("dataset", dataset);
    Ok(url)
}

/// Builds an authorized request, with a JSON body if `payload` is given.
pub(crate) fn new_api_request(
    method: Method,
    url: Url,
    auth_token: &str,
    payload: Option<&serde_json::Value>,
) -> Result<Request, ControllerError> {
    let mut request = Request::new(method, url);
    let authorization = HeaderValue::from_str(&format!("Bearer {}", auth_token))
        .map_err(|e| ControllerError::InvalidRequest(format!("invalid auth token: {}", e)))?;
    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, authorization);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(payload) = payload {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *request.body_mut() = Some(serde_json::to_vec(payload)?.into());
    }
    Ok(request)
}
