/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// The request to the Dash0 API could not be sent or the response could not be read.
    /// These are always worth another attempt.
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// The Dash0 API responded with a non-2xx status code.
    #[error("unexpected status code {status} when {action} {item} at {url}, response body is {body}")]
    HttpStatus {
        status: u16,
        action: &'static str,
        item: String,
        url: String,
        body: String,
    },
    /// An outbound request could not be constructed.
    #[error("{0}")]
    InvalidRequest(String),
    /// A sub-controller could not be started.
    #[error("{0}")]
    SubControllerStart(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ControllerError {
    /// Whether an outbound API call that failed with this error may be retried: transport
    /// failures and 5xx responses are retryable, every other response is final.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Http(_) => true,
            ControllerError::HttpStatus { status, .. } => !(400..500).contains(status),
            _ => false,
        }
    }
}
