//! Dependent resources of a Cluster
//!
//! Every ensurer follows the same shape: derive the resource's name from the
//! cluster, look it up in the cache, and create it only when it is absent.
//! Existing resources are never updated, and losing a create race to another
//! writer counts as success.

pub mod certificates;
pub mod credentials;
pub mod endpoint;
pub mod namespace;

pub use certificates::{
    ensure_apiserver_kubelet_client_secret_exists, ensure_apiserver_tls_secret_exists,
    ensure_root_ca_secret_exists,
};
pub use credentials::{ensure_service_account_key_secret_exists, ensure_token_users_secret_exists};
pub use endpoint::{
    ensure_external_apiserver_service_exists, AddressResolver, LoadBalancerAddressResolver,
};
pub use namespace::{cluster_namespace, ensure_cluster_namespace_exists, namespace_name};

use crate::Result;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use kubeception_api::Cluster;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Label put on every resource created for a cluster, value is the cluster name
pub const CLUSTER_LABEL: &str = "kubeception.k8s.io/cluster";

/// Metadata for a resource owned by `cluster`
pub(crate) fn cluster_object_meta(cluster: &Cluster, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.name_any())])),
        ..Default::default()
    }
}

/// An `Opaque` secret owned by `cluster`
pub(crate) fn opaque_secret(
    cluster: &Cluster,
    namespace: &str,
    name: &str,
    data: impl IntoIterator<Item = (&'static str, Vec<u8>)>,
) -> Secret {
    Secret {
        metadata: cluster_object_meta(cluster, name, Some(namespace)),
        data: Some(
            data.into_iter()
                .map(|(key, value)| (key.to_string(), ByteString(value)))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Interpret the result of a create, treating AlreadyExists as success
pub(crate) fn created<T>(result: Result<T>, kind: &str, key: &str) -> Result<()> {
    match result {
        Ok(_) => {
            info!("Created {} {}", kind, key);
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!("{} {} was created concurrently", kind, key);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
