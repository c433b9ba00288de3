use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use purger_core::Error;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ApiMetrics {
    requests: Family<RequestLabels, Counter>,
    request_duration: Family<RouteLabels, Histogram>,
    purged_pods: Counter,
    purge_failures: Family<FailureLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    route: &'static str,
    method: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RouteLabels {
    route: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    reason: &'static str,
}

// === impl ApiMetrics ===

impl ApiMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "http_requests",
            "Total number of HTTP requests handled, by route and status",
            requests.clone(),
        );

        let request_duration = Family::<RouteLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        reg.register_with_unit(
            "http_request_duration",
            "Histogram of HTTP request latency",
            Unit::Seconds,
            request_duration.clone(),
        );

        let purged_pods = Counter::default();
        reg.register(
            "purged_pods",
            "Total number of pods on which an object was purged",
            purged_pods.clone(),
        );

        let purge_failures = Family::<FailureLabels, Counter>::default();
        reg.register(
            "purge_failures",
            "Total number of failed purges, by reason",
            purge_failures.clone(),
        );

        Self {
            requests,
            request_duration,
            purged_pods,
            purge_failures,
        }
    }

    pub(crate) fn request(
        &self,
        route: &'static str,
        method: &http::Method,
        status: http::StatusCode,
        elapsed: Duration,
    ) {
        self.requests
            .get_or_create(&RequestLabels {
                route,
                method: method.to_string(),
                status: status.as_u16().to_string(),
            })
            .inc();
        self.request_duration
            .get_or_create(&RouteLabels { route })
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn purge(&self, outcome: &Result<usize, Error>) {
        let (purged, reason, failures) = match outcome {
            Ok(purged) => (*purged, None, 0),
            Err(Error::Validation(_)) => (0, Some("validation"), 1),
            Err(Error::NotFound(_)) => (0, Some("not_found"), 1),
            Err(Error::Upstream { purged, errors }) => (*purged, Some("pod"), errors.len()),
        };
        self.purged_pods.inc_by(purged as u64);
        if let Some(reason) = reason {
            self.purge_failures
                .get_or_create(&FailureLabels { reason })
                .inc_by(failures as u64);
        }
    }
}
