use crate::duration::parse_ttl;
use chrono::Duration;
use std::collections::BTreeMap;
use thiserror::Error;

/// Annotation keys understood by the lease controller. The prefix is a
/// deployment constant; everything the controller reads or writes on a
/// managed object lives under it.
pub mod keys {
    use const_format::concatcp;

    pub const PREFIX: &str = "lapse.dev";

    /// Written by the user to request lease management; its absence
    /// disables it.
    pub const TTL: &str = concatcp!(PREFIX, "/ttl");
    /// Anchor of the lease, an RFC3339 UTC instant. Settable by the user;
    /// filled in by the controller when missing.
    pub const LEASE_START: &str = concatcp!(PREFIX, "/lease-start");
    /// Derived expiry instant. Controller-owned.
    pub const EXPIRE_AT: &str = concatcp!(PREFIX, "/expire-at");
    /// Human-readable lease state or error. Controller-owned.
    pub const LEASE_STATUS: &str = concatcp!(PREFIX, "/lease-status");

    /// `<configmap>/<key>` selecting the cleanup script to run on expiry.
    pub const ON_DELETE_JOB: &str = concatcp!(PREFIX, "/on-delete-job");
    pub const JOB_SERVICE_ACCOUNT: &str = concatcp!(PREFIX, "/job-service-account");
    pub const JOB_IMAGE: &str = concatcp!(PREFIX, "/job-image");
    pub const JOB_ENV_SECRETS: &str = concatcp!(PREFIX, "/job-env-secrets");
    pub const JOB_WAIT: &str = concatcp!(PREFIX, "/job-wait");
    pub const JOB_TIMEOUT: &str = concatcp!(PREFIX, "/job-timeout");
    pub const JOB_TTL: &str = concatcp!(PREFIX, "/job-ttl");
    pub const JOB_BACKOFF_LIMIT: &str = concatcp!(PREFIX, "/job-backoff-limit");

    /// Annotations the cache projection keeps; everything else is dropped
    /// on insert (see the operator's cache transform).
    pub const KEEP: [&str; 12] = [
        TTL,
        LEASE_START,
        EXPIRE_AT,
        LEASE_STATUS,
        ON_DELETE_JOB,
        JOB_SERVICE_ACCOUNT,
        JOB_IMAGE,
        JOB_ENV_SECRETS,
        JOB_WAIT,
        JOB_TIMEOUT,
        JOB_TTL,
        JOB_BACKOFF_LIMIT,
    ];
}

/// Labels stamped onto cleanup jobs for discoverability.
pub mod labels {
    use super::keys::PREFIX;
    use const_format::concatcp;

    pub const SOURCE_KIND: &str = concatcp!(PREFIX, "/source-kind");
    pub const SOURCE_NAME: &str = concatcp!(PREFIX, "/source-name");
    pub const CLEANUP_JOB: &str = concatcp!(PREFIX, "/cleanup-job");
}

/// Projection of the lease annotations on a managed object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseAnnotations {
    pub ttl: Option<String>,
    pub lease_start: Option<String>,
    pub expire_at: Option<String>,
    pub lease_status: Option<String>,
}

impl LeaseAnnotations {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        LeaseAnnotations {
            ttl: annotations.get(keys::TTL).cloned(),
            lease_start: annotations.get(keys::LEASE_START).cloned(),
            expire_at: annotations.get(keys::EXPIRE_AT).cloned(),
            lease_status: annotations.get(keys::LEASE_STATUS).cloned(),
        }
    }

    /// True when any annotation the controller is responsible for removing
    /// is still present.
    pub fn has_controller_annotations(&self) -> bool {
        self.lease_start.is_some() || self.expire_at.is_some() || self.lease_status.is_some()
    }
}

pub const DEFAULT_JOB_SERVICE_ACCOUNT: &str = "default";
/// Shell plus `kubectl`, which is what most cleanup scripts want.
pub const DEFAULT_JOB_IMAGE: &str = "bitnami/kubectl:latest";
pub const DEFAULT_JOB_TTL_SECONDS: i32 = 300;
pub const DEFAULT_JOB_BACKOFF_LIMIT: i32 = 3;
const DEFAULT_JOB_TIMEOUT_SECONDS: i64 = 300;

/// A malformed `job-*` annotation on an expiring object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("annotation {key}: {detail}")]
pub struct CleanupConfigError {
    pub key: &'static str,
    pub detail: String,
}

fn malformed(key: &'static str, detail: impl Into<String>) -> CleanupConfigError {
    CleanupConfigError {
        key,
        detail: detail.into(),
    }
}

/// Cleanup-job options parsed off an expiring object's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    /// ConfigMap in the object's namespace holding the script.
    pub config_map: String,
    /// Key within the ConfigMap whose value is the script body.
    pub key: String,
    pub service_account: String,
    pub image: String,
    /// Secrets projected into the job's environment via `envFrom`.
    pub env_secrets: Vec<String>,
    /// When set, reconcile blocks until the job completes or `timeout`
    /// elapses.
    pub wait: bool,
    pub timeout: Duration,
    /// Seconds after completion before the job object self-removes.
    pub ttl_seconds: i32,
    pub backoff_limit: i32,
}

impl CleanupJob {
    /// Reads the cleanup-job options. `Ok(None)` means no cleanup was
    /// requested (`on-delete-job` absent); `Err` means it was requested but
    /// misconfigured, which callers surface and then ignore so the
    /// deletion is never blocked.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, CleanupConfigError> {
        let Some(source) = annotations.get(keys::ON_DELETE_JOB) else {
            return Ok(None);
        };
        let (config_map, key) = source
            .split_once('/')
            .filter(|(config_map, key)| !config_map.is_empty() && !key.is_empty())
            .ok_or_else(|| malformed(keys::ON_DELETE_JOB, "expected \"<configmap>/<key>\""))?;

        let service_account = annotations
            .get(keys::JOB_SERVICE_ACCOUNT)
            .cloned()
            .unwrap_or_else(|| DEFAULT_JOB_SERVICE_ACCOUNT.to_string());
        let image = annotations
            .get(keys::JOB_IMAGE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_JOB_IMAGE.to_string());
        let env_secrets = annotations
            .get(keys::JOB_ENV_SECRETS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let wait = match annotations.get(keys::JOB_WAIT) {
            None => false,
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => {
                    return Err(malformed(
                        keys::JOB_WAIT,
                        format!("expected a boolean, got {other:?}"),
                    ));
                }
            },
        };

        let timeout = match annotations.get(keys::JOB_TIMEOUT) {
            None => Duration::seconds(DEFAULT_JOB_TIMEOUT_SECONDS),
            Some(raw) => {
                let timeout = parse_ttl(raw)
                    .map_err(|e| malformed(keys::JOB_TIMEOUT, e.to_string()))?;
                if timeout <= Duration::zero() {
                    return Err(malformed(keys::JOB_TIMEOUT, "must be positive"));
                }
                timeout
            }
        };

        let ttl_seconds = parse_non_negative(annotations, keys::JOB_TTL, DEFAULT_JOB_TTL_SECONDS)?;
        let backoff_limit =
            parse_non_negative(annotations, keys::JOB_BACKOFF_LIMIT, DEFAULT_JOB_BACKOFF_LIMIT)?;

        Ok(Some(CleanupJob {
            config_map: config_map.to_string(),
            key: key.to_string(),
            service_account,
            image,
            env_secrets,
            wait,
            timeout,
            ttl_seconds,
            backoff_limit,
        }))
    }
}

fn parse_non_negative(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
    default: i32,
) -> Result<i32, CleanupConfigError> {
    let Some(raw) = annotations.get(key) else {
        return Ok(default);
    };
    let value: i32 = raw
        .trim()
        .parse()
        .map_err(|_| malformed(key, format!("expected an integer, got {raw:?}")))?;
    if value < 0 {
        return Err(malformed(key, "must not be negative"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn keys_carry_the_prefix() {
        assert_eq!(keys::TTL, "lapse.dev/ttl");
        assert_eq!(keys::LEASE_START, "lapse.dev/lease-start");
        assert_eq!(keys::EXPIRE_AT, "lapse.dev/expire-at");
        assert_eq!(labels::CLEANUP_JOB, "lapse.dev/cleanup-job");
        assert!(keys::KEEP.contains(&keys::ON_DELETE_JOB));
    }

    #[test]
    fn lease_projection_reads_only_its_keys() {
        let lease = LeaseAnnotations::from_annotations(&annotations(&[
            (keys::TTL, "5m"),
            (keys::LEASE_START, "2026-01-01T00:00:00Z"),
            ("unrelated.example.com/key", "x"),
        ]));
        assert_eq!(lease.ttl.as_deref(), Some("5m"));
        assert_eq!(lease.lease_start.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(lease.expire_at, None);
        assert!(!lease.has_controller_annotations());

        let residue =
            LeaseAnnotations::from_annotations(&annotations(&[(keys::LEASE_STATUS, "stale")]));
        assert!(residue.has_controller_annotations());
    }

    #[test]
    fn cleanup_absent_without_on_delete_job() {
        let parsed = CleanupJob::from_annotations(&annotations(&[(keys::TTL, "5m")])).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn cleanup_defaults() {
        let job = CleanupJob::from_annotations(&annotations(&[(
            keys::ON_DELETE_JOB,
            "scripts/teardown.sh",
        )]))
        .unwrap()
        .unwrap();
        assert_eq!(job.config_map, "scripts");
        assert_eq!(job.key, "teardown.sh");
        assert_eq!(job.service_account, "default");
        assert_eq!(job.image, DEFAULT_JOB_IMAGE);
        assert!(job.env_secrets.is_empty());
        assert!(!job.wait);
        assert_eq!(job.timeout, Duration::minutes(5));
        assert_eq!(job.ttl_seconds, 300);
        assert_eq!(job.backoff_limit, 3);
    }

    #[test]
    fn cleanup_reads_every_option() {
        let job = CleanupJob::from_annotations(&annotations(&[
            (keys::ON_DELETE_JOB, "hooks/final"),
            (keys::JOB_SERVICE_ACCOUNT, "janitor"),
            (keys::JOB_IMAGE, "registry.local/tools:v2"),
            (keys::JOB_ENV_SECRETS, " db-creds, ,api-token "),
            (keys::JOB_WAIT, "True"),
            (keys::JOB_TIMEOUT, "1m30s"),
            (keys::JOB_TTL, "60"),
            (keys::JOB_BACKOFF_LIMIT, "0"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(job.service_account, "janitor");
        assert_eq!(job.image, "registry.local/tools:v2");
        assert_eq!(job.env_secrets, vec!["db-creds", "api-token"]);
        assert!(job.wait);
        assert_eq!(job.timeout, Duration::seconds(90));
        assert_eq!(job.ttl_seconds, 60);
        assert_eq!(job.backoff_limit, 0);
    }

    #[test]
    fn cleanup_rejects_malformed_options() {
        let cases: &[(&str, &str)] = &[
            (keys::ON_DELETE_JOB, "noslash"),
            (keys::ON_DELETE_JOB, "/key"),
            (keys::ON_DELETE_JOB, "cm/"),
        ];
        for (key, value) in cases {
            let err = CleanupJob::from_annotations(&annotations(&[(key, value)])).unwrap_err();
            assert_eq!(err.key, keys::ON_DELETE_JOB, "case {value:?}");
        }

        let base = (keys::ON_DELETE_JOB, "cm/key");
        for (key, value) in [
            (keys::JOB_WAIT, "yes"),
            (keys::JOB_TIMEOUT, "5x"),
            (keys::JOB_TIMEOUT, "-1m"),
            (keys::JOB_TTL, "soon"),
            (keys::JOB_TTL, "-1"),
            (keys::JOB_BACKOFF_LIMIT, "-2"),
        ] {
            let err =
                CleanupJob::from_annotations(&annotations(&[base, (key, value)])).unwrap_err();
            assert_eq!(err.key, key, "case {key}={value:?}");
        }
    }
}
