use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{DeleteParams, DynamicObject, Preconditions};
use kube::{Resource, ResourceExt};
use kube::runtime::events::{Event, EventType};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;

use super::cleanup;
use super::reconcile::{ContextData, StartResolution, StartWrite};
use crate::util::{Error, patch};
use lapse_types::keys;

/// The exact timestamp form written to annotations: RFC3339, UTC, second
/// precision (`YYYY-MM-DDTHH:MM:SSZ`).
pub(super) fn fmt_utc(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Removes every controller-owned annotation after the user cleared `ttl`.
pub(super) async fn clean(context: &ContextData, object: &DynamicObject) -> Result<(), Error> {
    let mut changes: BTreeMap<&str, Option<String>> = BTreeMap::new();
    changes.insert(keys::LEASE_START, None);
    changes.insert(keys::EXPIRE_AT, None);
    changes.insert(keys::LEASE_STATUS, None);
    patch::patch_annotations(&context.api_for(object), &object.name_any(), &changes).await?;
    publish(
        context,
        object,
        EventType::Normal,
        "LeaseAnnotationsCleaned",
        "Removed lease annotations after the ttl annotation was cleared".to_string(),
        "Cleaning",
    )
    .await;
    Ok(())
}

/// Surfaces a TTL parse failure on `lease-status` without touching the
/// object otherwise. The object is never deleted on an unparseable TTL.
pub(super) async fn reject_ttl(
    context: &ContextData,
    object: &DynamicObject,
    start: StartResolution,
    detail: String,
) -> Result<(), Error> {
    let status = format!("Invalid TTL: {detail}");
    let mut changes: BTreeMap<&str, Option<String>> = BTreeMap::new();
    if start.write.is_some() {
        changes.insert(keys::LEASE_START, Some(fmt_utc(start.at)));
    }
    set_if_changed(object, &mut changes, keys::LEASE_STATUS, status.clone());
    if !changes.is_empty() {
        patch::patch_annotations(&context.api_for(object), &object.name_any(), &changes).await?;
    }
    record_start(context, object, &start).await;

    #[cfg(feature = "metrics")]
    context.metrics.invalid_ttl.inc();
    publish(
        context,
        object,
        EventType::Warning,
        "InvalidTTL",
        status,
        "Validating",
    )
    .await;
    Ok(())
}

/// Asserts the active-lease annotations. Reconcile requeues at expiry.
pub(super) async fn activate(
    context: &ContextData,
    object: &DynamicObject,
    start: StartResolution,
    expire: DateTime<Utc>,
) -> Result<(), Error> {
    let mut changes: BTreeMap<&str, Option<String>> = BTreeMap::new();
    if start.write.is_some() {
        changes.insert(keys::LEASE_START, Some(fmt_utc(start.at)));
    }
    set_if_changed(object, &mut changes, keys::EXPIRE_AT, fmt_utc(expire));
    set_if_changed(
        object,
        &mut changes,
        keys::LEASE_STATUS,
        format!("Lease active. Expires at {} UTC.", fmt_utc(expire)),
    );
    if !changes.is_empty() {
        patch::patch_annotations(&context.api_for(object), &object.name_any(), &changes).await?;
    }
    record_start(context, object, &start).await;
    Ok(())
}

/// Finalizes an expired lease: annotate, run the optional cleanup job, and
/// delete the object under a UID precondition. A failed delete is retried
/// by the next reconcile without re-emitting the expiry or counting it
/// twice; resubmission of the cleanup job is guarded separately.
pub(super) async fn expire(
    context: &ContextData,
    object: &DynamicObject,
    start: StartResolution,
    expire: DateTime<Utc>,
) -> Result<(), Error> {
    let mut changes: BTreeMap<&str, Option<String>> = BTreeMap::new();
    if start.write.is_some() {
        changes.insert(keys::LEASE_START, Some(fmt_utc(start.at)));
    }
    set_if_changed(object, &mut changes, keys::EXPIRE_AT, fmt_utc(expire));
    set_if_changed(
        object,
        &mut changes,
        keys::LEASE_STATUS,
        "Lease expired. Deleting object.".to_string(),
    );
    let newly_expired = !changes.is_empty();
    if newly_expired {
        patch::patch_annotations(&context.api_for(object), &object.name_any(), &changes).await?;
    }
    record_start(context, object, &start).await;

    if newly_expired {
        #[cfg(feature = "metrics")]
        context.metrics.leases_expired.inc();
        publish(
            context,
            object,
            EventType::Normal,
            "LeaseExpired",
            format!("Lease expired at {} UTC; deleting object", fmt_utc(expire)),
            "Expiring",
        )
        .await;
    }

    if object.annotations().contains_key(keys::ON_DELETE_JOB) {
        cleanup::run(context, object, start.at, expire).await;
    }

    delete(context, object).await
}

/// Deletes the object, guarded by its observed UID so a recreated namesake
/// is never removed. NotFound counts as success.
async fn delete(context: &ContextData, object: &DynamicObject) -> Result<(), Error> {
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            uid: object.uid(),
            resource_version: None,
        }),
        ..Default::default()
    };
    match context
        .api_for(object)
        .delete(&object.name_any(), &params)
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn record_start(context: &ContextData, object: &DynamicObject, start: &StartResolution) {
    match start.write {
        Some(StartWrite::Fresh) => {
            #[cfg(feature = "metrics")]
            context.metrics.leases_started.inc();
            publish(
                context,
                object,
                EventType::Normal,
                "LeaseStarted",
                format!("Lease started at {} UTC", fmt_utc(start.at)),
                "Leasing",
            )
            .await;
        }
        Some(StartWrite::Reset) => {
            publish(
                context,
                object,
                EventType::Warning,
                "LeaseStartReset",
                format!(
                    "lease-start was not a valid RFC3339 instant; reset to {} UTC",
                    fmt_utc(start.at)
                ),
                "Leasing",
            )
            .await;
        }
        None => {}
    }
}

fn set_if_changed(
    object: &DynamicObject,
    changes: &mut BTreeMap<&'static str, Option<String>>,
    key: &'static str,
    value: String,
) {
    if object.annotations().get(key) != Some(&value) {
        changes.insert(key, Some(value));
    }
}

/// Publishes an event against the managed object. Events are best-effort:
/// a recorder failure is logged and must never fail the reconcile (or
/// block a deletion).
pub(super) async fn publish(
    context: &ContextData,
    object: &DynamicObject,
    type_: EventType,
    reason: &str,
    note: String,
    action: &str,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    };
    let reference = object.object_ref(&context.resource);
    if let Err(e) = context.recorder.publish(&event, &reference).await {
        eprintln!(
            "{}",
            format!("failed to publish {reason} event: {e}").yellow()
        );
    }
}
