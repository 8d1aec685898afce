use super::MANAGER_NAME;
use kube::{
    Api,
    api::{DynamicObject, Patch, PatchParams},
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Builds a JSON merge patch that sets (`Some`) or clears (`None`) exactly
/// the given annotations. Touching nothing but the annotation map means
/// concurrent writers of spec or status never conflict with us.
pub fn annotations_merge(changes: &BTreeMap<&str, Option<String>>) -> Value {
    let annotations: Map<String, Value> = changes
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Some(value) => Value::String(value.clone()),
                None => Value::Null,
            };
            ((*key).to_string(), value)
        })
        .collect();
    json!({ "metadata": { "annotations": annotations } })
}

/// Applies an annotation merge patch under this controller's field manager.
pub async fn patch_annotations(
    api: &Api<DynamicObject>,
    name: &str,
    changes: &BTreeMap<&str, Option<String>>,
) -> Result<DynamicObject, kube::Error> {
    let params = PatchParams {
        field_manager: Some(MANAGER_NAME.to_string()),
        ..Default::default()
    };
    api.patch(name, &params, &Patch::Merge(annotations_merge(changes)))
        .await
}
