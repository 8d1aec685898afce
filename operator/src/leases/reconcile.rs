use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use kube::{
    Api, ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
    client::Client,
    runtime::{
        Controller, WatchStreamExt,
        controller::{Action, Config as ControllerConfig},
        events::{Recorder, Reporter},
        reflector::{ObjectRef, Store, store::Writer},
        watcher,
    },
};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use lapse_types::*;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{actions, cache};
use crate::namespaces::{self, NamespaceEvent, NamespaceEventKind, NamespaceTracker, OptInLabel};
use crate::util::{
    Error, MANAGER_NAME,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Buffered namespace events between the tracker and the rescan consumer.
/// Overflow is dropped by the tracker; the next resync heals it.
const NAMESPACE_EVENT_BUFFER: usize = 64;

/// Everything `run` needs besides the client.
pub struct Settings {
    pub resource: ApiResource,
    pub gvk: GroupVersionKind,
    pub opt_in: Option<OptInLabel>,
    pub leader_elect: bool,
    pub workers: u16,
    pub verbose: bool,
    pub ready: Arc<AtomicBool>,
}

/// Entrypoint for the lease controller.
pub async fn run(client: Client, settings: Settings) -> Result<(), Error> {
    println!(
        "{}{}",
        "⏳ Starting lease controller for ".green(),
        format_gvk(&settings.gvk).green().dimmed(),
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        lapse_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    // Without an opt-in label pair every namespace is considered tracked
    // and the namespace watch is not started at all.
    let tracker = settings.opt_in.as_ref().map(|_| Arc::new(NamespaceTracker::default()));
    if let (Some(opt_in), Some(tracker)) = (settings.opt_in.clone(), tracker.clone()) {
        let ns_client = client.clone();
        let ns_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = namespaces::run(ns_client, tracker, opt_in, ns_shutdown).await {
                eprintln!("{}", format!("namespace watch failed: {e}").red());
            }
        });
    }

    let context = Arc::new(ContextData::new(client.clone(), &settings, tracker, shutdown.clone()));

    lapse_common::signal_ready();

    if settings.leader_elect {
        run_with_leadership(client, context, &settings, shutdown).await
    } else {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = run_controller(context, settings.ready.clone(), settings.workers) => {}
        }
        Ok(())
    }
}

/// Leader-election standby loop: only the lease holder runs the
/// controller; losing the lease (or failing to renew it) aborts the
/// controller task and returns to standby.
async fn run_with_leadership(
    client: Client,
    context: Arc<ContextData>,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    // Namespace where the Lease object lives; inject NAMESPACE via the
    // Downward API when deploying. Unique identity per replica comes from
    // POD_NAME, falling back to hostname.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("lapse-operator-{}", uuid::Uuid::new_v4()));
    let lease_name = "lapse-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client,
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let workers = settings.workers;
    let ready = settings.ready.clone();
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(e) => {
                // If we can't talk to the apiserver / update the Lease,
                // assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if lease.acquired_lease {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let context = context.clone();
                let ready = ready.clone();
                controller_task = Some(tokio::spawn(async move {
                    run_controller(context, ready, workers).await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Wires the trimmed watch, the trigger filter and the namespace rescan
/// into a `kube_runtime::Controller` and drives it to completion.
async fn run_controller(context: Arc<ContextData>, ready: Arc<AtomicBool>, workers: u16) {
    let api: Api<DynamicObject> = Api::all_with(context.client.clone(), &context.resource);
    let writer = Writer::<DynamicObject>::new(context.resource.clone());
    let reader = writer.as_reader();

    {
        let store = reader.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            if store.wait_until_ready().await.is_ok() {
                ready.store(true, Ordering::Release);
                println!("{}", "🌱 Cache synced; lease reconciliation is live.".green());
            }
        });
    }

    let events = watcher(api, watcher::Config::default())
        .default_backoff()
        .modify(cache::prune)
        .reflect(writer)
        .applied_objects();
    let events = cache::filter_lease_events(events);

    let mut controller =
        Controller::for_stream_with(events, reader.clone(), context.resource.clone())
            .with_config(ControllerConfig::default().concurrency(workers));

    if let Some(tracker) = context.tracker.clone() {
        let (tx, rx) = mpsc::channel(NAMESPACE_EVENT_BUFFER);
        tracker.subscribe(tx);
        controller =
            controller.reconcile_on(opted_in_objects(rx, reader, context.resource.clone()));
    }

    controller
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

/// Maps each newly opted-in namespace to the cached objects in it that
/// carry a `ttl` annotation, so they reconcile without waiting for their
/// next watch event. Removals need no rescan: the next reconcile of any
/// object in the namespace observes the tracker and skips.
fn opted_in_objects(
    events: mpsc::Receiver<NamespaceEvent>,
    store: Store<DynamicObject>,
    resource: ApiResource,
) -> impl futures::Stream<Item = ObjectRef<DynamicObject>> {
    ReceiverStream::new(events).flat_map(move |event| {
        let refs: Vec<_> = match event.kind {
            NamespaceEventKind::Added => store
                .state()
                .into_iter()
                .filter(|obj| obj.namespace().as_deref() == Some(event.namespace.as_str()))
                .filter(|obj| obj.annotations().contains_key(keys::TTL))
                .map(|obj| {
                    ObjectRef::new_with(&obj.name_any(), resource.clone()).within(&event.namespace)
                })
                .collect(),
            NamespaceEventKind::Removed => Vec::new(),
        };
        stream::iter(refs)
    })
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub(super) struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    pub client: Client,
    pub resource: ApiResource,
    pub gvk: GroupVersionKind,
    pub recorder: Recorder,
    /// Present only when an opt-in label pair was configured.
    pub tracker: Option<Arc<NamespaceTracker>>,
    pub verbose: bool,
    pub shutdown: CancellationToken,

    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,
}

impl ContextData {
    fn new(
        client: Client,
        settings: &Settings,
        tracker: Option<Arc<NamespaceTracker>>,
        shutdown: CancellationToken,
    ) -> Self {
        let reporter = Reporter {
            controller: MANAGER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        ContextData {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            resource: settings.resource.clone(),
            gvk: settings.gvk.clone(),
            tracker,
            verbose: settings.verbose,
            shutdown,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new(&settings.gvk),
        }
    }

    /// Api scoped to the object's namespace, or cluster-wide for
    /// cluster-scoped kinds.
    pub fn api_for(&self, object: &DynamicObject) -> Api<DynamicObject> {
        match object.namespace() {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), &namespace, &self.resource)
            }
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

/// Action to be taken upon a managed object during reconciliation.
#[derive(Debug, PartialEq)]
enum LeaseAction {
    /// Not opted in, or nothing lease-related on the object.
    Skip,
    /// `ttl` was removed; controller-owned annotations must go too.
    Clean,
    /// `ttl` does not parse; surface it and leave the object alone.
    RejectTtl {
        start: StartResolution,
        detail: String,
    },
    /// The lease is live; assert annotations and wake at expiry.
    Activate {
        start: StartResolution,
        expire: DateTime<Utc>,
    },
    /// The lease is past expiry; finalize and delete.
    Expire {
        start: StartResolution,
        expire: DateTime<Utc>,
    },
}

impl LeaseAction {
    fn to_str(&self) -> &str {
        match self {
            LeaseAction::Skip => "Skip",
            LeaseAction::Clean => "Clean",
            LeaseAction::RejectTtl { .. } => "RejectTtl",
            LeaseAction::Activate { .. } => "Activate",
            LeaseAction::Expire { .. } => "Expire",
        }
    }
}

/// How the lease anchor was obtained for this reconcile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct StartResolution {
    pub at: DateTime<Utc>,
    /// `Some` when the controller must (re)write `lease-start`.
    pub write: Option<StartWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum StartWrite {
    /// No previous anchor; the lease starts now.
    Fresh,
    /// The user-supplied anchor failed to parse and was reset to now.
    Reset,
}

/// Reconciliation function for the managed GVK.
async fn reconcile(object: Arc<DynamicObject>, context: Arc<ContextData>) -> Result<Action, Error> {
    #[cfg(feature = "metrics")]
    let _timer = context.metrics.reconcile_duration.start_timer();

    let namespace = object.namespace();
    let tracked = match (&context.tracker, &namespace) {
        (Some(tracker), Some(namespace)) => tracker.contains(namespace),
        // Cluster-scoped objects cannot opt in per namespace.
        _ => true,
    };

    let lease = LeaseAnnotations::from_annotations(object.annotations());
    let now = Utc::now();

    // Read phase of reconciliation determines the goal of the write phase.
    let action = determine_action(&lease, now, tracked);

    if context.verbose && action != LeaseAction::Skip {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.as_deref().unwrap_or("-").color(FG2),
            "/".color(FG1),
            object.name_any().color(FG2),
            " ACTION: ".color(FG1),
            action.to_str().color(FG2),
        );
    }

    // Write phase.
    let result = match action {
        LeaseAction::Skip => Action::await_change(),
        LeaseAction::Clean => {
            actions::clean(&context, &object).await?;
            Action::await_change()
        }
        LeaseAction::RejectTtl { start, detail } => {
            actions::reject_ttl(&context, &object, start, detail).await?;
            Action::await_change()
        }
        LeaseAction::Activate { start, expire } => {
            actions::activate(&context, &object, start, expire).await?;
            Action::requeue((expire - now).to_std()?)
        }
        LeaseAction::Expire { start, expire } => {
            actions::expire(&context, &object, start, expire).await?;
            Action::await_change()
        }
    };
    Ok(result)
}

/// The lease state machine, pure over its inputs so two reconciles with the
/// same annotations and clock produce the same plan.
fn determine_action(lease: &LeaseAnnotations, now: DateTime<Utc>, tracked: bool) -> LeaseAction {
    if !tracked {
        return LeaseAction::Skip;
    }
    let Some(raw_ttl) = lease.ttl.as_deref() else {
        return if lease.has_controller_annotations() {
            LeaseAction::Clean
        } else {
            LeaseAction::Skip
        };
    };

    // The anchor is ensured before the TTL is parsed, so even an invalid
    // TTL leaves a usable lease-start behind for when it is fixed.
    let start = resolve_start(lease.lease_start.as_deref(), now);
    let ttl = match parse_ttl(raw_ttl) {
        Ok(ttl) => ttl,
        Err(InvalidDuration(detail)) => return LeaseAction::RejectTtl { start, detail },
    };
    let Some(expire) = start.at.checked_add_signed(ttl) else {
        return LeaseAction::RejectTtl {
            start,
            detail: "expiry is out of range".to_string(),
        };
    };

    if now >= expire {
        LeaseAction::Expire { start, expire }
    } else {
        LeaseAction::Activate { start, expire }
    }
}

fn resolve_start(raw: Option<&str>, now: DateTime<Utc>) -> StartResolution {
    match raw {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => StartResolution {
                at: at.with_timezone(&Utc),
                write: None,
            },
            Err(_) => StartResolution {
                at: now,
                write: Some(StartWrite::Reset),
            },
        },
        None => StartResolution {
            at: now,
            write: Some(StartWrite::Fresh),
        },
    }
}

/// Called whenever a reconciliation fails. Counts the failure and requeues
/// the object after a short pause.
fn on_error(object: Arc<DynamicObject>, error: &Error, context: Arc<ContextData>) -> Action {
    #[cfg(feature = "metrics")]
    context.metrics.reconcile_errors.inc();
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {error:?} ({}/{})",
            object.namespace().unwrap_or_default(),
            object.name_any(),
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

fn format_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
