//! Snapshot helpers behind `skiff cluster-info --dump-to`.

use serde_json::Value as Json;
use skiff_core::Printer;

use crate::{ClusterError, ClusterGateway};

const NOISY_METADATA: [&str; 6] = [
    "annotations",
    "creationTimestamp",
    "generation",
    "resourceVersion",
    "selfLink",
    "uid",
];

/// Strip server-populated noise so a dumped item can be re-applied.
pub fn scrub_items(items: &mut [Json]) {
    for item in items.iter_mut() {
        if let Some(obj) = item.as_object_mut() {
            obj.remove("status");
        }
        if let Some(meta) = item.get_mut("metadata").and_then(Json::as_object_mut) {
            for key in NOISY_METADATA {
                meta.remove(key);
            }
        }
    }
}

/// Overwrite each item's declared replicas with the live count, so applying
/// the dump elsewhere does not scale anything. An item whose live read fails
/// is reported and left as listed.
pub async fn refresh_replicas(
    gateway: &dyn ClusterGateway,
    items: &mut [Json],
    out: &dyn Printer,
) {
    for item in items.iter_mut() {
        let name = match item.pointer("/metadata/name").and_then(Json::as_str) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let namespace = item
            .pointer("/metadata/namespace")
            .and_then(Json::as_str)
            .unwrap_or("default")
            .to_string();
        match gateway.get_deployment(&namespace, &name).await {
            Ok(Some(live)) => {
                let replicas = live.spec.as_ref().and_then(|s| s.replicas);
                if let (Some(replicas), Some(spec)) =
                    (replicas, item.pointer_mut("/spec").and_then(Json::as_object_mut))
                {
                    spec.insert("replicas".to_string(), Json::from(replicas));
                }
            }
            Ok(None) => {
                out.error(&format!("No deployment {name} in namespace {namespace}"));
            }
            Err(e) => {
                out.error(&format!("Could not read replicas of {name}: {e}"));
            }
        }
    }
}

/// Render items as a `v1/List` document, the shape `kubectl apply` takes back.
pub fn dump_yaml(items: &[Json]) -> Result<String, ClusterError> {
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "metadata": {},
        "items": items,
    });
    serde_yaml::to_string(&list).map_err(|e| ClusterError::Decode(e.to_string()))
}
