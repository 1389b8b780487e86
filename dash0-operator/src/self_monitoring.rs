use std::time::Duration;

use dash0_operator_apis::SynchronizationStatus;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::utils::metric_name;

const KIND: &'static str = "kind";
const ACTION: &'static str = "action";
const STATUS: &'static str = "status";
const OUTCOME: &'static str = "outcome";

pub(crate) const OUTCOME_SUCCESS: &'static str = "success";
pub(crate) const OUTCOME_RETRYABLE: &'static str = "retryable_error";
pub(crate) const OUTCOME_PERMANENT: &'static str = "permanent_error";

/// Instruments recorded by the synchronization of third-party resources. Constructed
/// once and handed to every component that records something.
pub(crate) struct SelfMonitoring {
    reconcile_requests: Counter<u64>,
    synchronization_results: Counter<u64>,
    synchronization_duration: Histogram<f64>,
    http_request_attempts: Counter<u64>,
    status_update_failures: Counter<u64>,
}

impl SelfMonitoring {
    pub(crate) fn new(meter: &Meter) -> Self {
        let reconcile_requests = meter
            .u64_counter(metric_name("third_party_resource_reconcile_requests"))
            .with_description("Count of create, update and delete events for third-party resources")
            .build();
        let synchronization_results = meter
            .u64_counter(metric_name("third_party_resource_synchronization_results"))
            .with_description("Count of third-party resource synchronizations by resulting status")
            .build();
        let synchronization_duration = meter
            .f64_histogram(metric_name("third_party_resource_synchronization_duration_ms"))
            .with_description("Duration of synchronizing one third-party resource in milliseconds")
            .with_unit("ms")
            .build();
        let http_request_attempts = meter
            .u64_counter(metric_name("dash0_api_request_attempts"))
            .with_description("Count of requests sent to the Dash0 API by outcome")
            .build();
        let status_update_failures = meter
            .u64_counter(metric_name("monitoring_resource_status_update_failures"))
            .with_description("Count of synchronization results that could not be written to the monitoring resource")
            .build();
        Self {
            reconcile_requests,
            synchronization_results,
            synchronization_duration,
            http_request_attempts,
            status_update_failures,
        }
    }

    pub(crate) fn reconcile_request(&self, kind: &'static str, action: &'static str) {
        self.reconcile_requests
            .add(1, &[KeyValue::new(KIND, kind), KeyValue::new(ACTION, action)]);
    }

    pub(crate) fn synchronization_result(
        &self,
        kind: &'static str,
        status: SynchronizationStatus,
        elapsed: Duration,
    ) {
        let labels = [
            KeyValue::new(KIND, kind),
            KeyValue::new(STATUS, status.to_string()),
        ];
        self.synchronization_results.add(1, &labels);
        self.synchronization_duration
            .record(elapsed.as_secs_f64() * 1000.0, &labels[..1]);
    }

    pub(crate) fn http_request_attempt(&self, kind: &'static str, outcome: &'static str) {
        self.http_request_attempts
            .add(1, &[KeyValue::new(KIND, kind), KeyValue::new(OUTCOME, outcome)]);
    }

    pub(crate) fn status_update_failure(&self, kind: &'static str) {
        self.status_update_failures
            .add(1, &[KeyValue::new(KIND, kind)]);
    }
}

#[cfg(test)]
pub(crate) fn noop() -> std::sync::Arc<SelfMonitoring> {
    std::sync::Arc::new(SelfMonitoring::new(&opentelemetry::global::meter(
        "dash0_operator_test",
    )))
}
