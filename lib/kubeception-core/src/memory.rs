//! In-memory object store
//!
//! Serves as cache, writer and cluster client at once, so a reconcile pass
//! can run without an API server. Writes become visible to the listers
//! immediately.

use crate::cache::Lister;
use crate::orchestrator::Context;
use crate::resources::LoadBalancerAddressResolver;
use crate::store::{ClusterClient, ResourceWriter};
use crate::{CoreError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Namespace, Secret, Service, ServiceStatus,
};
use kube::ResourceExt;
use kubeception_api::Cluster;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

#[derive(Default)]
struct Objects {
    clusters: HashMap<String, Arc<Cluster>>,
    namespaces: HashMap<String, Arc<Namespace>>,
    // Keyed by namespace/name
    services: HashMap<String, Arc<Service>>,
    secrets: HashMap<String, Arc<Secret>>,
}

/// Object store holding everything in process memory
#[derive(Default)]
pub struct InMemoryStore {
    objects: RwLock<Objects>,
    writes: AtomicUsize,
    created: Mutex<Vec<String>>,
}

fn namespaced_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

fn required_name(kind: &str, name: Option<&String>) -> Result<String> {
    name.filter(|name| !name.is_empty())
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("{} without a name", kind)))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reconcile context backed entirely by this store
    pub fn context(self: &Arc<Self>, service_account_key_bits: usize) -> Context {
        Context {
            clusters: self.clone(),
            namespaces: self.clone(),
            services: self.clone(),
            secrets: self.clone(),
            writer: self.clone(),
            cluster_client: self.clone(),
            resolver: Arc::new(LoadBalancerAddressResolver::external_apiserver(self.clone())),
            service_account_key_bits,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Objects> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Objects> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_write(&self, what: String) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("store write: {}", what);
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(what);
    }

    /// Add or replace a cluster without counting it as a write
    pub fn insert_cluster(&self, cluster: Cluster) {
        self.write()
            .clusters
            .insert(cluster.name_any(), Arc::new(cluster));
    }

    pub fn remove_cluster(&self, name: &str) {
        self.write().clusters.remove(name);
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.read().clusters.get(name).cloned()
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.read().namespaces.get(name).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.read()
            .services
            .get(&namespaced_key(Some(namespace), name))
            .cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.read()
            .secrets
            .get(&namespaced_key(Some(namespace), name))
            .cloned()
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Written objects as `kind/key`, in write order
    pub fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_ingress(&self, namespace: &str, name: &str, ingress: LoadBalancerIngress) {
        let key = namespaced_key(Some(namespace), name);
        let mut objects = self.write();
        if let Some(service) = objects.services.get_mut(&key) {
            let service = Arc::make_mut(service);
            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![ingress]),
                }),
                ..Default::default()
            });
        }
    }

    /// Simulate a load balancer assigning an address to a service
    pub fn set_load_balancer_ip(&self, namespace: &str, name: &str, ip: &str) {
        self.set_ingress(
            namespace,
            name,
            LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn set_load_balancer_hostname(&self, namespace: &str, name: &str, hostname: &str) {
        self.set_ingress(
            namespace,
            name,
            LoadBalancerIngress {
                hostname: Some(hostname.to_string()),
                ..Default::default()
            },
        );
    }
}

impl Lister<Cluster> for InMemoryStore {
    fn get(&self, _namespace: Option<&str>, name: &str) -> Result<Arc<Cluster>> {
        self.cluster(name)
            .ok_or_else(|| CoreError::not_found("cluster", name))
    }
}

impl Lister<Namespace> for InMemoryStore {
    fn get(&self, _namespace: Option<&str>, name: &str) -> Result<Arc<Namespace>> {
        self.namespace(name)
            .ok_or_else(|| CoreError::not_found("namespace", name))
    }
}

impl Lister<Service> for InMemoryStore {
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<Service>> {
        let key = namespaced_key(namespace, name);
        self.read()
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::not_found("service", key))
    }
}

impl Lister<Secret> for InMemoryStore {
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<Secret>> {
        let key = namespaced_key(namespace, name);
        self.read()
            .secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::not_found("secret", key))
    }
}

#[async_trait]
impl ResourceWriter for InMemoryStore {
    async fn create_namespace(&self, namespace: Namespace) -> Result<Namespace> {
        let name = required_name("namespace", namespace.metadata.name.as_ref())?;
        {
            let mut objects = self.write();
            if objects.namespaces.contains_key(&name) {
                return Err(CoreError::already_exists("namespace", name));
            }
            objects
                .namespaces
                .insert(name.clone(), Arc::new(namespace.clone()));
        }
        self.record_write(format!("namespace/{}", name));
        Ok(namespace)
    }

    async fn create_service(&self, namespace: &str, mut service: Service) -> Result<Service> {
        let name = required_name("service", service.metadata.name.as_ref())?;
        service.metadata.namespace = Some(namespace.to_string());
        let key = namespaced_key(Some(namespace), &name);
        {
            let mut objects = self.write();
            if objects.services.contains_key(&key) {
                return Err(CoreError::already_exists("service", key));
            }
            objects.services.insert(key.clone(), Arc::new(service.clone()));
        }
        self.record_write(format!("service/{}", key));
        Ok(service)
    }

    async fn create_secret(&self, namespace: &str, mut secret: Secret) -> Result<Secret> {
        let name = required_name("secret", secret.metadata.name.as_ref())?;
        secret.metadata.namespace = Some(namespace.to_string());
        let key = namespaced_key(Some(namespace), &name);
        {
            let mut objects = self.write();
            if objects.secrets.contains_key(&key) {
                return Err(CoreError::already_exists("secret", key));
            }
            objects.secrets.insert(key.clone(), Arc::new(secret.clone()));
        }
        self.record_write(format!("secret/{}", key));
        Ok(secret)
    }
}

#[async_trait]
impl ClusterClient for InMemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        self.cluster(name)
            .map(|cluster| cluster.as_ref().clone())
            .ok_or_else(|| CoreError::not_found("cluster", name))
    }

    async fn patch_cluster(&self, name: &str, patch: &serde_json::Value) -> Result<Cluster> {
        let patched = {
            let mut objects = self.write();
            let current = objects
                .clusters
                .get(name)
                .ok_or_else(|| CoreError::not_found("cluster", name))?;
            let mut doc = serde_json::to_value(current.as_ref())?;
            json_patch::merge(&mut doc, patch);
            let patched: Cluster = serde_json::from_value(doc)?;
            objects
                .clusters
                .insert(name.to_string(), Arc::new(patched.clone()));
            patched
        };
        self.record_write(format!("cluster/{}", name));
        Ok(patched)
    }
}
