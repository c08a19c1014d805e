//! Store access against the Kubernetes API server

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use kubeception_api::Cluster;
use kubeception_core::store::{ClusterClient, ResourceWriter};
use kubeception_core::{CoreError, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "kubeception-controller";

/// Map API failures onto the core's expected conditions
fn map_api_error(err: kube::Error, kind: &'static str, key: &str) -> CoreError {
    match err {
        kube::Error::Api(response) if response.code == 404 => CoreError::not_found(kind, key),
        kube::Error::Api(response) if response.code == 409 => {
            CoreError::already_exists(kind, key)
        }
        other => CoreError::KubernetesError(other),
    }
}

/// Split a merge patch into its status part and the rest
///
/// Status can only be written through the status subresource.
fn split_status(patch: &Value) -> (Option<Value>, Option<Value>) {
    let Value::Object(entries) = patch else {
        return (Some(patch.clone()), None);
    };

    let mut main = Map::new();
    let mut status = None;
    for (key, value) in entries {
        if key == "status" {
            status = Some(serde_json::json!({ "status": value }));
        } else {
            main.insert(key.clone(), value.clone());
        }
    }
    ((!main.is_empty()).then_some(Value::Object(main)), status)
}

/// KubeStore writes through to the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get the underlying Kubernetes client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceWriter for KubeStore {
    async fn create_namespace(&self, namespace: Namespace) -> Result<Namespace> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&Self::post_params(), &namespace)
            .await
            .map_err(|e| map_api_error(e, "namespace", &name))
    }

    async fn create_service(&self, namespace: &str, service: Service) -> Result<Service> {
        let key = format!(
            "{}/{}",
            namespace,
            service.metadata.name.as_deref().unwrap_or_default()
        );
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), &service)
            .await
            .map_err(|e| map_api_error(e, "service", &key))
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret> {
        let key = format!(
            "{}/{}",
            namespace,
            secret.metadata.name.as_deref().unwrap_or_default()
        );
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), &secret)
            .await
            .map_err(|e| map_api_error(e, "secret", &key))
    }
}

#[async_trait]
impl ClusterClient for KubeStore {
    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, "cluster", name))
    }

    async fn patch_cluster(&self, name: &str, patch: &Value) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let (main, status) = split_status(patch);

        let mut patched = None;
        if let Some(main) = main {
            debug!(cluster = %name, "patching cluster");
            patched = Some(
                api.patch(name, &Self::patch_params(), &Patch::Merge(&main))
                    .await
                    .map_err(|e| map_api_error(e, "cluster", name))?,
            );
        }
        if let Some(status) = status {
            debug!(cluster = %name, "patching cluster status");
            patched = Some(
                api.patch_status(name, &Self::patch_params(), &Patch::Merge(&status))
                    .await
                    .map_err(|e| map_api_error(e, "cluster", name))?,
            );
        }

        match patched {
            Some(cluster) => Ok(cluster),
            None => self.get_cluster(name).await,
        }
    }
}
