//! Three-way JSON merge patches for Cluster records
//!
//! The controller works on cached copies that may be stale by the time it
//! writes. Instead of sending its whole copy back, it sends only the fields it
//! changed relative to what it observed, and leaves out anything the store
//! already agrees with. Concurrent edits to other fields survive.

use crate::store::ClusterClient;
use crate::Result;
use kube::ResourceExt;
use kubeception_api::Cluster;
use serde_json::{Map, Value};
use tracing::debug;

/// Compute the merge patch (RFC 7386) that carries the changes from
/// `original` to `modified` over to `current`
///
/// Returns an empty object when there is nothing to write.
pub fn three_way_merge_patch(original: &Value, modified: &Value, current: &Value) -> Value {
    diff(original, modified)
        .and_then(|delta| prune(delta, Some(current)))
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Whether a merge patch would leave its target untouched
pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(entries) if entries.is_empty())
}

fn diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = Map::new();
            for (key, value) in modified {
                match original.get(key) {
                    Some(previous) => {
                        if let Some(change) = diff(previous, value) {
                            patch.insert(key.clone(), change);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !modified.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (original, modified) if original == modified => None,
        (_, modified) => Some(modified.clone()),
    }
}

fn prune(patch: Value, current: Option<&Value>) -> Option<Value> {
    match (patch, current) {
        (Value::Null, None | Some(Value::Null)) => None,
        (patch, Some(current)) if &patch == current => None,
        (Value::Object(entries), current) => {
            // Without a parent object in current, deletions below it are done
            let current = match current {
                Some(Value::Object(current)) => Some(current),
                _ => None,
            };
            let pruned: Map<String, Value> = entries
                .into_iter()
                .filter_map(|(key, value)| {
                    let current = current.and_then(|current| current.get(&key));
                    prune(value, current).map(|value| (key, value))
                })
                .collect();
            (!pruned.is_empty()).then_some(Value::Object(pruned))
        }
        (patch, _) => Some(patch),
    }
}

/// Persist the difference between `observed` and `intended` to the store
///
/// The latest version is fetched from the store so that fields already
/// carrying the intended value are not written again. Returns whether a
/// patch was sent.
pub async fn patch_cluster(
    client: &dyn ClusterClient,
    observed: &Cluster,
    intended: &Cluster,
) -> Result<bool> {
    let name = observed.name_any();
    let original = serde_json::to_value(observed)?;
    let modified = serde_json::to_value(intended)?;
    if original == modified {
        return Ok(false);
    }

    let current = serde_json::to_value(client.get_cluster(&name).await?)?;
    let patch = three_way_merge_patch(&original, &modified, &current);
    if is_empty_patch(&patch) {
        debug!(cluster = %name, "cluster already up to date, skipping patch");
        return Ok(false);
    }

    debug!(cluster = %name, %patch, "patching cluster");
    client.patch_cluster(&name, &patch).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockClusterClient;
    use kubeception_api::{ApiEndpoint, ClusterStatus};
    use serde_json::json;

    fn apply(target: &Value, patch: &Value) -> Value {
        let mut target = target.clone();
        json_patch::merge(&mut target, patch);
        target
    }

    #[test]
    fn test_identical_inputs_give_empty_patch() {
        let doc = json!({"spec": {"a": 1}, "status": {"b": [1, 2]}});
        let patch = three_way_merge_patch(&doc, &doc, &doc);
        assert_eq!(patch, json!({}));
        assert!(is_empty_patch(&patch));
    }

    #[test]
    fn test_change_is_carried_over() {
        let original = json!({"spec": {"a": 1}, "status": {}});
        let modified = json!({"spec": {"a": 1}, "status": {"host": "203.0.113.10"}});
        let current = original.clone();

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"status": {"host": "203.0.113.10"}}));
        assert_eq!(apply(&current, &patch), modified);
    }

    #[test]
    fn test_concurrent_edit_survives() {
        let original = json!({"spec": {"replicas": 1, "image": "v1"}, "status": {}});
        let modified = json!({"spec": {"replicas": 1, "image": "v1"}, "status": {"ready": true}});
        let current = json!({"spec": {"replicas": 3, "image": "v1"}, "status": {}});

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"status": {"ready": true}}));
        assert_eq!(
            apply(&current, &patch),
            json!({"spec": {"replicas": 3, "image": "v1"}, "status": {"ready": true}})
        );
    }

    #[test]
    fn test_removed_field_becomes_null() {
        let original = json!({"status": {"errorMessage": "boom", "ready": false}});
        let modified = json!({"status": {"ready": false}});
        let current = original.clone();

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"status": {"errorMessage": null}}));
    }

    #[test]
    fn test_removal_already_done_in_current_is_dropped() {
        let original = json!({"status": {"errorMessage": "boom"}});
        let modified = json!({"status": {}});
        let current = json!({"status": {}});

        assert_eq!(three_way_merge_patch(&original, &modified, &current), json!({}));
    }

    #[test]
    fn test_removal_under_missing_parent_is_dropped() {
        let original = json!({"status": {"errorMessage": "x", "a": 1}});
        let modified = json!({"status": {"a": 1}});
        let current = json!({});

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({}));
        assert_eq!(apply(&current, &patch), current);
    }

    #[test]
    fn test_addition_under_missing_parent_is_kept() {
        let original = json!({"status": {"errorMessage": "x"}});
        let modified = json!({"status": {"ready": true}});
        let current = json!({"status": null});

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"status": {"ready": true}}));
    }

    #[test]
    fn test_change_already_in_current_is_dropped() {
        let original = json!({"status": {"apiEndpoints": []}});
        let modified = json!({"status": {"apiEndpoints": [{"host": "203.0.113.10", "port": 6443}]}});
        let current = modified.clone();

        assert_eq!(three_way_merge_patch(&original, &modified, &current), json!({}));
    }

    #[test]
    fn test_arrays_are_replaced_whole() {
        let original = json!({"list": [1, 2, 3]});
        let modified = json!({"list": [1, 2]});
        let current = json!({"list": [1, 2, 3], "other": true});

        let patch = three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"list": [1, 2]}));
    }

    fn cluster_with_endpoint(host: Option<&str>) -> Cluster {
        let mut cluster = Cluster::new("demo", Default::default());
        cluster.status = Some(ClusterStatus {
            api_endpoints: host
                .map(|host| {
                    vec![ApiEndpoint {
                        host: host.to_string(),
                        port: 6443,
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        });
        cluster
    }

    #[tokio::test]
    async fn test_patch_cluster_skips_unchanged_copy() {
        let mut client = MockClusterClient::new();
        client.expect_get_cluster().never();
        client.expect_patch_cluster().never();

        let cluster = cluster_with_endpoint(None);
        assert!(!patch_cluster(&client, &cluster, &cluster).await.unwrap());
    }

    #[tokio::test]
    async fn test_patch_cluster_sends_status_change() {
        let observed = cluster_with_endpoint(None);
        let intended = cluster_with_endpoint(Some("203.0.113.10"));

        let mut client = MockClusterClient::new();
        let current = observed.clone();
        client
            .expect_get_cluster()
            .withf(|name| name == "demo")
            .times(1)
            .returning(move |_| Ok(current.clone()));
        let patched = intended.clone();
        client
            .expect_patch_cluster()
            .withf(|name, patch| {
                name == "demo"
                    && *patch
                        == json!({"status": {"apiEndpoints": [{"host": "203.0.113.10", "port": 6443}]}})
            })
            .times(1)
            .returning(move |_, _| Ok(patched.clone()));

        assert!(patch_cluster(&client, &observed, &intended).await.unwrap());
    }

    #[tokio::test]
    async fn test_patch_cluster_skips_when_store_already_matches() {
        let observed = cluster_with_endpoint(None);
        let intended = cluster_with_endpoint(Some("203.0.113.10"));

        let mut client = MockClusterClient::new();
        let current = intended.clone();
        client
            .expect_get_cluster()
            .times(1)
            .returning(move |_| Ok(current.clone()));
        client.expect_patch_cluster().never();

        assert!(!patch_cluster(&client, &observed, &intended).await.unwrap());
    }
}
