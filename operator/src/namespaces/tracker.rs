use owo_colors::OwoColorize;
use std::collections::BTreeSet;
use std::sync::RwLock;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceEventKind {
    Added,
    Removed,
}

/// Membership change emitted to tracker subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEvent {
    pub namespace: String,
    pub kind: NamespaceEventKind,
}

/// Process-wide set of namespaces that opted in to lease management.
///
/// Subscribers are notified with a non-blocking send; a full channel drops
/// the event rather than stalling the tracker. A missed `Added` heals on
/// the next cache resync, and a missed `Removed` only delays skipping a
/// namespace until its objects next reconcile.
#[derive(Default)]
pub struct NamespaceTracker {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    namespaces: BTreeSet<String>,
    subscribers: Vec<mpsc::Sender<NamespaceEvent>>,
}

impl NamespaceTracker {
    /// Idempotently inserts `namespace`; notifies subscribers on the first
    /// insertion only. Returns whether the set changed.
    pub fn add(&self, namespace: &str) -> bool {
        let mut inner = self.inner.write().expect("tracker lock poisoned");
        let inserted = inner.namespaces.insert(namespace.to_string());
        if inserted {
            notify(&mut inner, namespace, NamespaceEventKind::Added);
        }
        inserted
    }

    /// Idempotently removes `namespace`; notifies subscribers on a real
    /// removal only. Returns whether the set changed.
    pub fn remove(&self, namespace: &str) -> bool {
        let mut inner = self.inner.write().expect("tracker lock poisoned");
        let removed = inner.namespaces.remove(namespace);
        if removed {
            notify(&mut inner, namespace, NamespaceEventKind::Removed);
        }
        removed
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .namespaces
            .contains(namespace)
    }

    /// Snapshot copy of the current membership.
    pub fn list(&self) -> BTreeSet<String> {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .namespaces
            .clone()
    }

    /// Registers a bounded channel for membership notifications. Closed
    /// receivers are dropped on the next notification.
    pub fn subscribe(&self, sender: mpsc::Sender<NamespaceEvent>) {
        self.inner
            .write()
            .expect("tracker lock poisoned")
            .subscribers
            .push(sender);
    }
}

fn notify(inner: &mut Inner, namespace: &str, kind: NamespaceEventKind) {
    inner.subscribers.retain(|subscriber| {
        let event = NamespaceEvent {
            namespace: namespace.to_string(),
            kind,
        };
        match subscriber.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                eprintln!(
                    "{}",
                    format!(
                        "⚠️ dropping namespace event {:?} {}: subscriber is not keeping up",
                        event.kind, event.namespace
                    )
                    .yellow()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_add_keeps_membership() {
        let tracker = NamespaceTracker::default();
        assert!(tracker.add("team-a"));
        assert!(tracker.remove("team-a"));
        assert!(tracker.add("team-a"));
        assert!(tracker.contains("team-a"));
        assert_eq!(tracker.list().len(), 1);
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let tracker = NamespaceTracker::default();
        assert!(tracker.add("team-a"));
        assert!(!tracker.add("team-a"));
        assert!(tracker.remove("team-a"));
        assert!(!tracker.remove("team-a"));
        assert!(!tracker.contains("team-a"));
    }

    #[tokio::test]
    async fn subscribers_see_real_changes_only() {
        let tracker = NamespaceTracker::default();
        let (tx, mut rx) = mpsc::channel(8);
        tracker.subscribe(tx);

        tracker.add("team-a");
        tracker.add("team-a");
        tracker.remove("team-a");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, NamespaceEventKind::Added);
        assert_eq!(first.namespace, "team-a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, NamespaceEventKind::Removed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_never_blocks_the_tracker() {
        let tracker = NamespaceTracker::default();
        let (tx, mut rx) = mpsc::channel(1);
        tracker.subscribe(tx);

        // The second event overflows the channel and is dropped; both calls
        // must return immediately.
        tracker.add("one");
        tracker.add("two");
        assert!(tracker.contains("one"));
        assert!(tracker.contains("two"));

        assert_eq!(rx.recv().await.unwrap().namespace, "one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let tracker = NamespaceTracker::default();
        let (tx, rx) = mpsc::channel(1);
        tracker.subscribe(tx);
        drop(rx);

        tracker.add("one");
        assert!(tracker.contains("one"));
        assert!(tracker.inner.read().unwrap().subscribers.is_empty());
    }
}
