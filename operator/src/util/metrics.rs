use kube::api::GroupVersionKind;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use std::collections::HashMap;

const PREFIX: &str = "lapse";

/// Collectors for one controller instance, registered on the default
/// registry. Every series carries `{group, version, kind}` constant labels
/// so fleets of per-GVK controllers can share one scrape config.
pub struct ControllerMetrics {
    pub info: IntGauge,
    pub leases_started: IntCounter,
    pub leases_expired: IntCounter,
    pub invalid_ttl: IntCounter,
    pub reconcile_errors: IntCounter,
    pub reconcile_duration: Histogram,
    pub cleanup_jobs_created: IntCounter,
    pub cleanup_jobs_completed: IntCounter,
    pub cleanup_jobs_failed: IntCounter,
    pub cleanup_job_duration: Histogram,
}

impl ControllerMetrics {
    pub fn new(gvk: &GroupVersionKind) -> Self {
        let labels: HashMap<String, String> = HashMap::from([
            ("group".to_string(), gvk.group.clone()),
            ("version".to_string(), gvk.version.clone()),
            ("kind".to_string(), gvk.kind.clone()),
        ]);

        let counter = |name: &str, help: &str| {
            let opts = Opts::new(format!("{PREFIX}_{name}"), help).const_labels(labels.clone());
            let counter = IntCounter::with_opts(opts).expect("valid counter opts");
            prometheus::default_registry()
                .register(Box::new(counter.clone()))
                .expect("register counter");
            counter
        };
        let histogram = |name: &str, help: &str| {
            let opts =
                HistogramOpts::new(format!("{PREFIX}_{name}"), help).const_labels(labels.clone());
            let histogram = Histogram::with_opts(opts).expect("valid histogram opts");
            prometheus::default_registry()
                .register(Box::new(histogram.clone()))
                .expect("register histogram");
            histogram
        };

        let info = IntGauge::with_opts(
            Opts::new(
                format!("{PREFIX}_info"),
                "Marks this lease controller's metric family as live",
            )
            .const_labels(labels.clone()),
        )
        .expect("valid gauge opts");
        prometheus::default_registry()
            .register(Box::new(info.clone()))
            .expect("register gauge");
        info.set(1);

        ControllerMetrics {
            info,
            leases_started: counter("leases_started_total", "Leases anchored with a new start"),
            leases_expired: counter("leases_expired_total", "Leases that reached expiry"),
            invalid_ttl: counter("invalid_ttl_total", "TTL annotations that failed to parse"),
            reconcile_errors: counter("reconcile_errors_total", "Reconciles that returned an error"),
            reconcile_duration: histogram(
                "reconcile_duration_seconds",
                "Wall time spent in a single reconcile",
            ),
            cleanup_jobs_created: counter("cleanup_jobs_created_total", "Cleanup jobs submitted"),
            cleanup_jobs_completed: counter(
                "cleanup_jobs_completed_total",
                "Cleanup jobs that reported Complete",
            ),
            cleanup_jobs_failed: counter(
                "cleanup_jobs_failed_total",
                "Cleanup jobs that failed, timed out or could not be submitted",
            ),
            cleanup_job_duration: histogram(
                "cleanup_job_duration_seconds",
                "Wall time waiting for cleanup jobs in wait mode",
            ),
        }
    }
}
