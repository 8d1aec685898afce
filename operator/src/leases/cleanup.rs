use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvFromSource, EnvVar, KeyToPath, PodSpec, PodTemplateSpec,
    SecretEnvSource, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, PostParams};
use kube::runtime::events::EventType;
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

use super::actions::{fmt_utc, publish};
use super::reconcile::ContextData;
use lapse_types::{CleanupJob, labels};

const SCRIPT_DIR: &str = "/scripts";
const SCRIPT_FILE: &str = "cleanup-script";
const SCRIPT_VOLUME: &str = "cleanup-script";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Runs the user's cleanup job for an expiring object.
///
/// Every failure mode ends in an event and a return: the object's deletion
/// is the system's primary guarantee and is never blocked by cleanup.
pub(super) async fn run(
    context: &ContextData,
    object: &DynamicObject,
    started: DateTime<Utc>,
    expired: DateTime<Utc>,
) {
    let Some(namespace) = object.namespace() else {
        // Jobs are namespaced; a cluster-scoped object has nowhere to run one.
        publish(
            context,
            object,
            EventType::Warning,
            "CleanupJobConfigInvalid",
            "cleanup jobs are not supported on cluster-scoped objects".to_string(),
            "Cleaning",
        )
        .await;
        return;
    };
    let name = object.name_any();

    // The cache projection strips labels and foreign annotations; the job
    // environment wants all of them, so take a fresh read.
    let fresh = match context.api_for(object).get(&name).await {
        Ok(fresh) => fresh,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return,
        Err(e) => {
            #[cfg(feature = "metrics")]
            context.metrics.cleanup_jobs_failed.inc();
            publish(
                context,
                object,
                EventType::Warning,
                "CleanupJobFailed",
                format!("failed to read object before cleanup: {e}"),
                "Cleaning",
            )
            .await;
            return;
        }
    };

    let config = match CleanupJob::from_annotations(fresh.annotations()) {
        Ok(Some(config)) => config,
        Ok(None) => return,
        Err(e) => {
            publish(
                context,
                object,
                EventType::Warning,
                "CleanupJobConfigInvalid",
                e.to_string(),
                "Cleaning",
            )
            .await;
            return;
        }
    };

    let jobs: Api<Job> = Api::namespaced(context.client.clone(), &namespace);

    // A retried delete must not run the user's script a second time; the
    // labels stamped on every cleanup job identify an earlier submission.
    let selector = format!(
        "{}=true,{}={},{}={}",
        labels::CLEANUP_JOB,
        labels::SOURCE_KIND,
        truncate_label(&context.gvk.kind),
        labels::SOURCE_NAME,
        truncate_label(&name),
    );
    match jobs.list(&ListParams::default().labels(&selector)).await {
        Ok(existing) => {
            if let Some(existing) = existing.items.into_iter().next() {
                if config.wait {
                    wait_for_job(context, object, &jobs, &existing.name_any(), &config).await;
                }
                return;
            }
        }
        Err(e) => {
            eprintln!(
                "{}",
                format!("failed to look up existing cleanup jobs for {name}: {e}").yellow()
            );
            return;
        }
    }

    let job_name = job_name(&name);
    let job = build_job(
        &context.gvk, &fresh, &config, started, expired, &job_name, &namespace,
    );

    if let Err(e) = jobs.create(&PostParams::default(), &job).await {
        #[cfg(feature = "metrics")]
        context.metrics.cleanup_jobs_failed.inc();
        publish(
            context,
            object,
            EventType::Warning,
            "CleanupJobFailed",
            format!("failed to submit cleanup job {job_name}: {e}"),
            "Cleaning",
        )
        .await;
        return;
    }
    #[cfg(feature = "metrics")]
    context.metrics.cleanup_jobs_created.inc();
    publish(
        context,
        object,
        EventType::Normal,
        "CleanupJobCreated",
        format!("Created cleanup job {job_name}"),
        "Cleaning",
    )
    .await;

    if config.wait {
        wait_for_job(context, object, &jobs, &job_name, &config).await;
    }
}

/// Polls the job every two seconds until it reports a terminal condition,
/// the configured timeout elapses, or the process shuts down.
async fn wait_for_job(
    context: &ContextData,
    object: &DynamicObject,
    jobs: &Api<Job>,
    job_name: &str,
    config: &CleanupJob,
) {
    #[cfg(feature = "metrics")]
    let _timer = context.metrics.cleanup_job_duration.start_timer();

    let timeout = config
        .timeout
        .to_std()
        .unwrap_or(Duration::from_secs(300));
    let deadline = Instant::now() + timeout;
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => {
                #[cfg(feature = "metrics")]
                context.metrics.cleanup_jobs_failed.inc();
                publish(
                    context,
                    object,
                    EventType::Warning,
                    "CleanupJobFailed",
                    format!("canceled while waiting for cleanup job {job_name}"),
                    "Cleaning",
                )
                .await;
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                #[cfg(feature = "metrics")]
                context.metrics.cleanup_jobs_failed.inc();
                publish(
                    context,
                    object,
                    EventType::Warning,
                    "CleanupJobTimeout",
                    format!(
                        "cleanup job {job_name} did not complete within {}s",
                        config.timeout.num_seconds()
                    ),
                    "Cleaning",
                )
                .await;
                return;
            }
            _ = poll.tick() => {}
        }

        let job = match jobs.get(job_name).await {
            Ok(job) => job,
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("failed to poll cleanup job {job_name}: {e}").yellow()
                );
                continue;
            }
        };
        match job_outcome(&job) {
            Some(Ok(())) => {
                #[cfg(feature = "metrics")]
                context.metrics.cleanup_jobs_completed.inc();
                publish(
                    context,
                    object,
                    EventType::Normal,
                    "CleanupJobCompleted",
                    format!("Cleanup job {job_name} completed"),
                    "Cleaning",
                )
                .await;
                return;
            }
            Some(Err(message)) => {
                #[cfg(feature = "metrics")]
                context.metrics.cleanup_jobs_failed.inc();
                publish(
                    context,
                    object,
                    EventType::Warning,
                    "CleanupJobFailed",
                    format!("cleanup job {job_name} failed: {message}"),
                    "Cleaning",
                )
                .await;
                return;
            }
            None => {}
        }
    }
}

/// Maps the job's status conditions to a terminal outcome. `None` means
/// the job is still running.
fn job_outcome(job: &Job) -> Option<Result<(), String>> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(Ok(())),
            "Failed" => {
                return Some(Err(condition
                    .message
                    .clone()
                    .unwrap_or_else(|| "cleanup job failed".to_string())));
            }
            _ => {}
        }
    }
    None
}

/// `<object>-cleanup-<suffix>`, bounded to a DNS label so repeated expiries
/// of namesakes never collide.
fn job_name(object_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..8];
    let max = 63 - "-cleanup-".len() - suffix.len();
    let base = if object_name.len() > max {
        object_name[..max].trim_end_matches('-')
    } else {
        object_name
    };
    format!("{base}-cleanup-{suffix}")
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn truncate_label(value: &str) -> String {
    let mut value = value;
    if value.len() > 63 {
        value = value[..63].trim_end_matches('-');
    }
    value.to_string()
}

/// Builds the one-shot job that runs the user's script with the expiring
/// object's identity in its environment.
fn build_job(
    gvk: &GroupVersionKind,
    object: &DynamicObject,
    config: &CleanupJob,
    started: DateTime<Utc>,
    expired: DateTime<Utc>,
    job_name: &str,
    namespace: &str,
) -> Job {
    let labels_json = serde_json::to_string(object.labels()).unwrap_or_default();
    let annotations_json = serde_json::to_string(object.annotations()).unwrap_or_default();

    let env = vec![
        env("OBJECT_NAME", object.name_any()),
        env("OBJECT_NAMESPACE", namespace),
        env("OBJECT_KIND", gvk.kind.clone()),
        env("OBJECT_GROUP", gvk.group.clone()),
        env("OBJECT_VERSION", gvk.version.clone()),
        env("OBJECT_UID", object.uid().unwrap_or_default()),
        env(
            "OBJECT_RESOURCE_VERSION",
            object.resource_version().unwrap_or_default(),
        ),
        env("LEASE_STARTED_AT", fmt_utc(started)),
        env("LEASE_EXPIRED_AT", fmt_utc(expired)),
        env("OBJECT_LABELS", labels_json),
        env("OBJECT_ANNOTATIONS", annotations_json),
    ];
    let env_from: Vec<EnvFromSource> = config
        .env_secrets
        .iter()
        .map(|secret| EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.clone(),
                optional: None,
            }),
            ..Default::default()
        })
        .collect();

    let job_labels = BTreeMap::from([
        (labels::SOURCE_KIND.to_string(), truncate_label(&gvk.kind)),
        (
            labels::SOURCE_NAME.to_string(),
            truncate_label(&object.name_any()),
        ),
        (labels::CLEANUP_JOB.to_string(), "true".to_string()),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(config.backoff_limit),
            ttl_seconds_after_finished: Some(config.ttl_seconds),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(config.service_account.clone()),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "cleanup".to_string(),
                        image: Some(config.image.clone()),
                        command: Some(vec![format!("{SCRIPT_DIR}/{SCRIPT_FILE}")]),
                        env: Some(env),
                        env_from: (!env_from.is_empty()).then_some(env_from),
                        volume_mounts: Some(vec![VolumeMount {
                            name: SCRIPT_VOLUME.to_string(),
                            mount_path: SCRIPT_DIR.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: SCRIPT_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config.config_map.clone(),
                            items: Some(vec![KeyToPath {
                                key: config.key.clone(),
                                path: SCRIPT_FILE.to_string(),
                                mode: Some(0o755),
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::api::batch::v1::JobStatus;
    use kube::api::ApiResource;
    use lapse_types::keys;

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    fn expiring_object() -> DynamicObject {
        let resource = ApiResource::from_gvk(&gvk());
        let mut object = DynamicObject::new("web", &resource).within("team-a");
        object.metadata.uid = Some("uid-1".to_string());
        object.metadata.resource_version = Some("7".to_string());
        object.metadata.labels = Some(BTreeMap::from([(
            "app".to_string(),
            "web".to_string(),
        )]));
        object.metadata.annotations = Some(BTreeMap::from([
            (keys::TTL.to_string(), "1s".to_string()),
            (keys::ON_DELETE_JOB.to_string(), "scripts/final".to_string()),
        ]));
        object
    }

    fn config() -> CleanupJob {
        CleanupJob::from_annotations(expiring_object().annotations())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn job_names_fit_a_dns_label() {
        let name = job_name("web");
        assert!(name.starts_with("web-cleanup-"));
        assert!(name.len() <= 63);

        let long = "x".repeat(80);
        let name = job_name(&long);
        assert!(name.len() <= 63);
        assert!(name.contains("-cleanup-"));
    }

    #[test]
    fn job_projects_the_script_executable() {
        let started = Utc::now();
        let job = build_job(
            &gvk(),
            &expiring_object(),
            &config(),
            started,
            started,
            "web-cleanup-1234abcd",
            "team-a",
        );

        let spec = job.spec.unwrap();
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.command.as_deref(),
            Some(&["/scripts/cleanup-script".to_string()][..])
        );
        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/scripts");
        assert_eq!(mount.read_only, Some(true));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        let config_map = volume.config_map.as_ref().unwrap();
        assert_eq!(config_map.name, "scripts");
        let item = &config_map.items.as_ref().unwrap()[0];
        assert_eq!(item.key, "final");
        assert_eq!(item.path, "cleanup-script");
        assert_eq!(item.mode, Some(0o755));

        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some("default"));
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
    }

    #[test]
    fn job_environment_describes_the_object() {
        let started = Utc::now();
        let job = build_job(
            &gvk(),
            &expiring_object(),
            &config(),
            started,
            started,
            "web-cleanup-1234abcd",
            "team-a",
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
                .unwrap_or_default()
        };
        assert_eq!(get("OBJECT_NAME"), "web");
        assert_eq!(get("OBJECT_NAMESPACE"), "team-a");
        assert_eq!(get("OBJECT_KIND"), "Deployment");
        assert_eq!(get("OBJECT_GROUP"), "apps");
        assert_eq!(get("OBJECT_VERSION"), "v1");
        assert_eq!(get("OBJECT_UID"), "uid-1");
        assert_eq!(get("OBJECT_RESOURCE_VERSION"), "7");
        assert_eq!(get("LEASE_STARTED_AT"), fmt_utc(started));
        assert!(get("OBJECT_LABELS").contains("\"app\":\"web\""));
        assert!(get("OBJECT_ANNOTATIONS").contains(keys::ON_DELETE_JOB));
    }

    #[test]
    fn job_labels_point_back_at_the_source() {
        let started = Utc::now();
        let job = build_job(
            &gvk(),
            &expiring_object(),
            &config(),
            started,
            started,
            "web-cleanup-1234abcd",
            "team-a",
        );
        let job_labels = job.metadata.labels.unwrap();
        assert_eq!(job_labels.get(labels::SOURCE_KIND).unwrap(), "Deployment");
        assert_eq!(job_labels.get(labels::SOURCE_NAME).unwrap(), "web");
        assert_eq!(job_labels.get(labels::CLEANUP_JOB).unwrap(), "true");
    }

    #[test]
    fn env_secrets_become_env_from_sources() {
        let mut object = expiring_object();
        object.metadata.annotations.as_mut().unwrap().insert(
            keys::JOB_ENV_SECRETS.to_string(),
            "db-creds,api-token".to_string(),
        );
        let config = CleanupJob::from_annotations(object.annotations())
            .unwrap()
            .unwrap();
        let started = Utc::now();
        let job = build_job(
            &gvk(),
            &object,
            &config,
            started,
            started,
            "web-cleanup-1234abcd",
            "team-a",
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        let env_from = pod.containers[0].env_from.as_ref().unwrap();
        let names: Vec<_> = env_from
            .iter()
            .map(|source| source.secret_ref.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["db-creds", "api-token"]);
    }

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    message: Some("boom".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn job_outcome_reads_terminal_conditions() {
        assert_eq!(job_outcome(&Job::default()), None);
        assert_eq!(
            job_outcome(&job_with_condition("Complete", "True")),
            Some(Ok(()))
        );
        assert_eq!(
            job_outcome(&job_with_condition("Failed", "True")),
            Some(Err("boom".to_string()))
        );
        // a False condition is not terminal
        assert_eq!(job_outcome(&job_with_condition("Complete", "False")), None);
    }
}
