use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{WatchStreamExt, watcher},
};
use owo_colors::OwoColorize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::NamespaceTracker;
use crate::util::Error;

/// Label key/value pair a namespace must carry to opt in.
#[derive(Debug, Clone)]
pub struct OptInLabel {
    pub key: String,
    pub value: String,
}

/// Watches namespaces and keeps the tracker's membership in sync with the
/// opt-in label. Runs until the process shuts down.
pub async fn run(
    client: Client,
    tracker: Arc<NamespaceTracker>,
    opt_in: OptInLabel,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    println!(
        "{}{}",
        "🔭 Watching namespaces for opt-in label ".green(),
        format!("{}={}", opt_in.key, opt_in.value).green().dimmed(),
    );

    let api: Api<Namespace> = Api::all(client);
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .modify(|ns| {
            // membership only needs labels and the deletion marker
            ns.managed_fields_mut().clear();
            ns.annotations_mut().clear();
            ns.status = None;
        })
        .touched_objects()
        .predicate_filter(membership_projection);
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            item = stream.try_next() => match item {
                Ok(Some(ns)) => apply(&tracker, &opt_in, &ns),
                Ok(None) => break Ok(()),
                Err(e) => eprintln!("{}", format!("namespace watch error: {e}").yellow()),
            },
        }
    }
}

/// Hash of everything that can change a namespace's membership: its label
/// set, generation, and whether deletion has begun.
fn membership_projection(ns: &Namespace) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    ns.metadata.labels.hash(&mut hasher);
    ns.metadata.generation.hash(&mut hasher);
    ns.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

fn apply(tracker: &NamespaceTracker, opt_in: &OptInLabel, ns: &Namespace) {
    let name = ns.name_any();
    let opted_in = ns.metadata.deletion_timestamp.is_none()
        && ns.labels().get(&opt_in.key) == Some(&opt_in.value);
    if opted_in {
        if tracker.add(&name) {
            println!(
                "{}{}",
                "🟢 Namespace opted in: ".green(),
                name.green().dimmed()
            );
        }
    } else if tracker.remove(&name) {
        println!(
            "{}{}",
            "⚪ Namespace opted out: ".green(),
            name.green().dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn opt_in() -> OptInLabel {
        OptInLabel {
            key: "lapse.dev/enabled".to_string(),
            value: "true".to_string(),
        }
    }

    fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn labeled_namespaces_join_and_leave() {
        let tracker = NamespaceTracker::default();
        let opt_in = opt_in();

        apply(
            &tracker,
            &opt_in,
            &namespace("team-a", &[("lapse.dev/enabled", "true")]),
        );
        assert!(tracker.contains("team-a"));

        // wrong value does not count
        apply(
            &tracker,
            &opt_in,
            &namespace("team-b", &[("lapse.dev/enabled", "yes")]),
        );
        assert!(!tracker.contains("team-b"));

        apply(&tracker, &opt_in, &namespace("team-a", &[]));
        assert!(!tracker.contains("team-a"));
    }

    #[test]
    fn terminating_namespaces_are_removed() {
        let tracker = NamespaceTracker::default();
        let opt_in = opt_in();

        let mut ns = namespace("team-a", &[("lapse.dev/enabled", "true")]);
        apply(&tracker, &opt_in, &ns);
        assert!(tracker.contains("team-a"));

        ns.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        apply(&tracker, &opt_in, &ns);
        assert!(!tracker.contains("team-a"));
    }

    #[test]
    fn projection_tracks_membership_inputs() {
        let plain = namespace("team-a", &[]);
        let labeled = namespace("team-a", &[("lapse.dev/enabled", "true")]);
        assert_ne!(
            membership_projection(&plain),
            membership_projection(&labeled)
        );

        let mut terminating = labeled.clone();
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_ne!(
            membership_projection(&labeled),
            membership_projection(&terminating)
        );

        assert_eq!(
            membership_projection(&labeled),
            membership_projection(&labeled.clone())
        );
    }
}
