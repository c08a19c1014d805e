//! Per-cluster namespace

use super::{cluster_object_meta, created};
use crate::cache::{exists, Lister};
use crate::store::ResourceWriter;
use crate::Result;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kubeception_api::Cluster;

const CLUSTER_NAMESPACE_PREFIX: &str = "cluster-";

/// Namespace holding all resources of the cluster called `cluster_name`
pub fn namespace_name(cluster_name: &str) -> String {
    format!("{}{}", CLUSTER_NAMESPACE_PREFIX, cluster_name)
}

pub fn cluster_namespace(cluster: &Cluster) -> String {
    namespace_name(&cluster.name_any())
}

pub async fn ensure_cluster_namespace_exists(
    cluster: &Cluster,
    namespaces: &dyn Lister<Namespace>,
    writer: &dyn ResourceWriter,
) -> Result<()> {
    let name = cluster_namespace(cluster);
    if exists(namespaces, None, &name)? {
        return Ok(());
    }

    let namespace = Namespace {
        metadata: cluster_object_meta(cluster, &name, None),
        ..Default::default()
    };
    created(writer.create_namespace(namespace).await, "namespace", &name)
}
