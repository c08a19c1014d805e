//! Ordered reconciliation of all resources a hosted cluster depends on

use crate::cache::Lister;
use crate::resources::{self, AddressResolver};
use crate::store::{ClusterClient, ResourceWriter};
use crate::Result;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kubeception_api::Cluster;
use std::sync::Arc;

/// Everything a reconcile pass reads from and writes to
#[derive(Clone)]
pub struct Context {
    pub clusters: Arc<dyn Lister<Cluster>>,
    pub namespaces: Arc<dyn Lister<Namespace>>,
    pub services: Arc<dyn Lister<Service>>,
    pub secrets: Arc<dyn Lister<Secret>>,
    pub writer: Arc<dyn ResourceWriter>,
    pub cluster_client: Arc<dyn ClusterClient>,
    pub resolver: Arc<dyn AddressResolver>,
    /// Size of generated service account signing keys
    pub service_account_key_bits: usize,
}

/// Bring every dependent resource of `cluster` into existence
///
/// Steps run strictly in order and the first failure ends the pass. Nothing
/// is rolled back: the next pass finds the finished steps already done. No
/// secret is created before the external address is known, so a pass on a
/// fresh cluster stops after the service until the load balancer is
/// provisioned.
pub async fn ensure_cluster_resources_exist(cluster: &Cluster, ctx: &Context) -> Result<()> {
    let secrets = ctx.secrets.as_ref();
    let writer = ctx.writer.as_ref();
    let resolver = ctx.resolver.as_ref();

    resources::ensure_cluster_namespace_exists(cluster, ctx.namespaces.as_ref(), writer)
        .await
        .map_err(|e| e.in_step("cluster namespace"))?;

    resources::ensure_external_apiserver_service_exists(cluster, ctx.services.as_ref(), writer)
        .await
        .map_err(|e| e.in_step("external apiserver service"))?;

    resolver
        .resolve(cluster)
        .map_err(|e| e.in_step("external apiserver address"))?;

    resources::ensure_root_ca_secret_exists(cluster, secrets, writer)
        .await
        .map_err(|e| e.in_step("root ca secret"))?;

    resources::ensure_apiserver_tls_secret_exists(cluster, secrets, writer, resolver)
        .await
        .map_err(|e| e.in_step("apiserver tls secret"))?;

    resources::ensure_apiserver_kubelet_client_secret_exists(cluster, secrets, writer, resolver)
        .await
        .map_err(|e| e.in_step("apiserver kubelet client secret"))?;

    resources::ensure_service_account_key_secret_exists(
        cluster,
        secrets,
        writer,
        ctx.service_account_key_bits,
    )
    .await
    .map_err(|e| e.in_step("service account key secret"))?;

    resources::ensure_token_users_secret_exists(cluster, secrets, writer)
        .await
        .map_err(|e| e.in_step("token users secret"))?;

    Ok(())
}
