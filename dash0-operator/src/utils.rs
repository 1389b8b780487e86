use std::{future::Future, time::Duration};

use kube::{ResourceExt, api::DynamicObject};
use tokio::time::sleep;

/// Namespace and name of a namespaced Kubernetes object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&DynamicObject> for NamespacedName {
    fn from(o: &DynamicObject) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }
}

/// Retry schedule: at most `steps` attempts, sleeping `duration` after the first failed
/// attempt and multiplying the sleep by `factor` after every further one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
}

impl Backoff {
    pub(crate) fn new(steps: u32, duration: Duration, factor: f64) -> Self {
        Self {
            steps,
            duration,
            factor,
        }
    }
}

/// Runs `operation` until it succeeds, it fails with an error for which `retryable`
/// returns `false`, or the attempts of `backoff` are used up. Returns the last error.
pub(crate) async fn retry_on_error<T, E, F, Fut, R>(
    backoff: Backoff,
    retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut delay = backoff.duration;
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < backoff.steps && retryable(&e) => {
                sleep(delay).await;
                delay = delay.mul_f64(backoff.factor);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Prepares a value for use as a single URL path segment. The Dash0 API treats an
/// encoded slash like a plain one, so slashes are replaced before percent-encoding.
pub(crate) fn path_segment(s: &str) -> String {
    s.replace('/', "|")
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("dash0_operator_{}", name)
}
