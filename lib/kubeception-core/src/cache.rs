//! Read access to the locally mirrored store state

use crate::{CoreError, Result};
use kube::{Resource, ResourceExt};
use std::sync::Arc;

/// Cached, possibly stale, read access to objects of one kind
///
/// Implementations are filled by a watch layer the core does not own;
/// the core never writes through them.
pub trait Lister<K>: Send + Sync {
    /// Look up an object. A missing object is reported as `CoreError::NotFound`.
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<K>>;
}

/// Work-queue key of an object: `namespace/name`, or just `name` for
/// cluster-scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Split a work-queue key back into namespace and name
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns).filter(|ns| !ns.is_empty()), *name)),
        _ => Err(CoreError::Internal(format!("malformed object key {:?}", key))),
    }
}

/// Whether an object is present in the cache, with only NotFound counting
/// as absent
pub fn exists<K>(lister: &dyn Lister<K>, namespace: Option<&str>, name: &str) -> Result<bool> {
    match lister.get(namespace, name) {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
