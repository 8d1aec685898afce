use futures::{Stream, StreamExt, future};
use kube::ResourceExt;
use kube::api::DynamicObject;
use lapse_types::keys;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// How long a filter cache entry may go untouched before eviction. Deleted
/// objects never produce another event, so this bounds the map.
const FILTER_ENTRY_TTL: Duration = Duration::from_secs(3600);

/// Cache projection applied to every insert/update of the watched GVK.
///
/// Keeps identity, the deletion marker and the lease annotations; drops
/// managed-field history, labels and the entire payload. Watching a
/// high-cardinality kind cluster-wide is only viable because the store
/// holds this projection instead of full objects.
pub fn prune(obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;
    obj.metadata.labels = None;
    obj.metadata.owner_references = None;
    obj.metadata.finalizers = None;
    if let Some(annotations) = obj.metadata.annotations.take() {
        let kept: std::collections::BTreeMap<String, String> = annotations
            .into_iter()
            .filter(|(key, _)| keys::KEEP.contains(&key.as_str()))
            .collect();
        if !kept.is_empty() {
            obj.metadata.annotations = Some(kept);
        }
    }
    obj.data = serde_json::Value::Object(Default::default());
}

/// Hash of the projection that decides whether a watch event is worth a
/// reconcile: the user-facing `ttl` and `lease-start` values. Our own
/// writes (`expire-at`, `lease-status`) deliberately do not change it, so
/// the controller does not reconcile its own patches.
fn trigger_projection(obj: &DynamicObject) -> u64 {
    let annotations = obj.annotations();
    let mut hasher = DefaultHasher::new();
    annotations.get(keys::TTL).hash(&mut hasher);
    annotations.get(keys::LEASE_START).hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    namespace: Option<String>,
    name: String,
    uid: Option<String>,
}

/// Admits an object event only when its trigger projection changed since
/// the last event for the same object. The first sighting of every object
/// always passes, which re-runs the state machine once after each watch
/// restart; the state machine is idempotent, so that is just warm-up cost.
pub fn filter_lease_events<S, E>(stream: S) -> impl Stream<Item = Result<DynamicObject, E>>
where
    S: Stream<Item = Result<DynamicObject, E>>,
{
    let mut seen: HashMap<FilterKey, (u64, Instant)> = HashMap::new();
    stream.filter_map(move |event| {
        let admit = match &event {
            Ok(obj) => {
                let now = Instant::now();
                seen.retain(|_, (_, last_seen)| now.duration_since(*last_seen) < FILTER_ENTRY_TTL);
                let key = FilterKey {
                    namespace: obj.namespace(),
                    name: obj.name_any(),
                    uid: obj.uid(),
                };
                let hash = trigger_projection(obj);
                let changed = seen.get(&key).map(|(seen_hash, _)| *seen_hash) != Some(hash);
                seen.insert(key, (hash, now));
                changed
            }
            Err(_) => true,
        };
        future::ready(admit.then_some(event))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use kube::api::{ApiResource, GroupVersionKind};
    use std::collections::BTreeMap;

    fn resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"))
    }

    fn object(name: &str, annotations: &[(&str, &str)]) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &resource()).within("default");
        obj.metadata.uid = Some(format!("uid-{name}"));
        if !annotations.is_empty() {
            obj.metadata.annotations = Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            );
        }
        obj
    }

    #[test]
    fn prune_keeps_identity_and_lease_annotations_only() {
        let mut obj = object(
            "web",
            &[
                (keys::TTL, "5m"),
                (keys::ON_DELETE_JOB, "cm/key"),
                ("unrelated.example.com/note", "x"),
            ],
        );
        obj.metadata.resource_version = Some("41".to_string());
        obj.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        obj.metadata.managed_fields = Some(vec![Default::default()]);
        obj.data = serde_json::json!({"spec": {"replicas": 3}});

        prune(&mut obj);

        assert_eq!(obj.metadata.name.as_deref(), Some("web"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(obj.metadata.uid.as_deref(), Some("uid-web"));
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("41"));
        assert_eq!(obj.metadata.labels, None);
        assert_eq!(obj.metadata.managed_fields, None);
        assert_eq!(obj.data, serde_json::json!({}));
        let kept = obj.metadata.annotations.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains_key(keys::TTL));
        assert!(kept.contains_key(keys::ON_DELETE_JOB));
    }

    #[test]
    fn prune_drops_an_all_foreign_annotation_map() {
        let mut obj = object("web", &[("unrelated.example.com/note", "x")]);
        prune(&mut obj);
        assert_eq!(obj.metadata.annotations, None);
    }

    #[test]
    fn projection_ignores_controller_writes() {
        let base = object("web", &[(keys::TTL, "5m")]);
        let mut with_status = object("web", &[(keys::TTL, "5m")]);
        with_status
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(keys::LEASE_STATUS.to_string(), "Lease active.".to_string());
        assert_eq!(trigger_projection(&base), trigger_projection(&with_status));

        let mut changed = object("web", &[(keys::TTL, "10m")]);
        changed.metadata.resource_version = Some("99".to_string());
        assert_ne!(trigger_projection(&base), trigger_projection(&changed));
    }

    #[tokio::test]
    async fn filter_admits_changes_and_suppresses_noise() {
        let a1 = object("web", &[(keys::TTL, "5m")]);
        let mut a2 = a1.clone();
        a2.metadata.resource_version = Some("2".to_string());
        let a3 = object("web", &[(keys::TTL, "10m")]);
        let b1 = object("db", &[]);

        let events: Vec<Result<DynamicObject, String>> =
            vec![Ok(a1), Ok(a2), Ok(a3), Ok(b1), Err("watch hiccup".to_string())];
        let admitted: Vec<_> = filter_lease_events(stream::iter(events)).collect().await;

        // a1 (first sighting), a3 (ttl changed), b1 (first sighting), error
        assert_eq!(admitted.len(), 4);
        assert!(admitted.iter().any(|r| r.is_err()));
    }

    #[tokio::test]
    async fn filter_admits_ttl_removal_for_cleanup() {
        let with_ttl = object(
            "web",
            &[(keys::TTL, "5m"), (keys::LEASE_STATUS, "Lease active.")],
        );
        let without_ttl = object("web", &[(keys::LEASE_STATUS, "Lease active.")]);

        let events: Vec<Result<DynamicObject, String>> = vec![Ok(with_ttl), Ok(without_ttl)];
        let admitted: Vec<_> = filter_lease_events(stream::iter(events)).collect().await;
        assert_eq!(admitted.len(), 2);
    }
}
