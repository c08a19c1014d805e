//! Write access to the object store

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kubeception_api::Cluster;

#[cfg(test)]
use mockall::automock;

/// Creates dependent resources
///
/// Creates are never upserts: an object that is already present is
/// reported as `CoreError::AlreadyExists`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceWriter: Send + Sync {
    async fn create_namespace(&self, namespace: Namespace) -> Result<Namespace>;

    async fn create_service(&self, namespace: &str, service: Service) -> Result<Service>;

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret>;
}

/// Direct (uncached) access to Cluster records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the latest version of a cluster from the store
    async fn get_cluster(&self, name: &str) -> Result<Cluster>;

    /// Apply a JSON merge patch to a cluster
    async fn patch_cluster(&self, name: &str, patch: &serde_json::Value) -> Result<Cluster>;
}
