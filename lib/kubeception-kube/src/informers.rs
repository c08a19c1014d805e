//! Reflector-backed caches and the watches feeding the work queue

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{reflector, watcher, WatchStreamExt};
use kubeception_api::Cluster;
use kubeception_core::cache::{object_key, Lister};
use kubeception_core::queue::RateLimitingQueue;
use kubeception_core::resources::{LoadBalancerAddressResolver, CLUSTER_LABEL};
use kubeception_core::{Context, CoreError, Result};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::KubeStore;

/// Read access to a reflector store
pub struct CachedLister<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash,
{
    store: Store<K>,
    kind: &'static str,
}

impl<K> CachedLister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(store: Store<K>, kind: &'static str) -> Self {
        Self { store, kind }
    }
}

impl<K> Lister<K> for CachedLister<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<K>> {
        let mut reference = ObjectRef::<K>::new(name);
        if let Some(namespace) = namespace {
            reference = reference.within(namespace);
        }
        self.store.get(&reference).ok_or_else(|| {
            let key = match namespace {
                Some(namespace) => format!("{}/{}", namespace, name),
                None => name.to_string(),
            };
            CoreError::not_found(self.kind, key)
        })
    }
}

/// Name of the cluster a dependent resource belongs to
fn owning_cluster<K: Resource>(obj: &K) -> Option<&str> {
    obj.labels().get(CLUSTER_LABEL).map(String::as_str)
}

fn enqueue_owner<K: Resource>(queue: Arc<RateLimitingQueue>) -> impl Fn(&K) + Send + 'static {
    move |obj: &K| {
        if let Some(cluster) = owning_cluster(obj) {
            queue.add(cluster);
        }
    }
}

/// Watch configuration for namespaces, services and secrets
///
/// Unfiltered, so objects created before the ownership label existed still
/// count as present. The label is only used to map events to a cluster.
fn dependent_watch_config() -> watcher::Config {
    watcher::Config::default()
}

/// Start a reflector for `api`, calling `on_object` for every object the
/// watch applies or deletes
fn watch<K, F>(api: Api<K>, config: watcher::Config, on_object: F) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    F: Fn(&K) + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&Default::default()).to_string();
    let mut stream = reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects()
        .boxed();

    let handle = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(obj) => on_object(&obj),
                Err(e) => warn!("{} watch error: {}", kind, e),
            }
        }
        debug!("{} watch ended", kind);
    });
    (reader, handle)
}

/// Informers for clusters and their dependent resources
///
/// Cluster changes enqueue the cluster's key. Dependents are cached whether
/// or not they carry the ownership label, but only labelled ones enqueue the
/// cluster named by the label, so a service getting its load
/// balancer address is picked up without waiting for a retry.
pub struct Informers {
    pub clusters: Store<Cluster>,
    pub namespaces: Store<Namespace>,
    pub services: Store<Service>,
    pub secrets: Store<Secret>,
    tasks: Vec<JoinHandle<()>>,
}

impl Informers {
    pub fn start(client: Client, queue: Arc<RateLimitingQueue>) -> Self {
        info!("Starting informers");

        let cluster_queue = queue.clone();
        let (clusters, clusters_task) = watch(
            Api::<Cluster>::all(client.clone()),
            watcher::Config::default(),
            move |cluster: &Cluster| cluster_queue.add(&object_key(cluster)),
        );
        let (namespaces, namespaces_task) = watch(
            Api::<Namespace>::all(client.clone()),
            dependent_watch_config(),
            enqueue_owner(queue.clone()),
        );
        let (services, services_task) = watch(
            Api::<Service>::all(client.clone()),
            dependent_watch_config(),
            enqueue_owner(queue.clone()),
        );
        let (secrets, secrets_task) = watch(
            Api::<Secret>::all(client),
            dependent_watch_config(),
            enqueue_owner(queue),
        );

        Self {
            clusters,
            namespaces,
            services,
            secrets,
            tasks: vec![clusters_task, namespaces_task, services_task, secrets_task],
        }
    }

    /// Wait until every cache holds its initial listing
    pub async fn wait_until_ready(&self) -> anyhow::Result<()> {
        self.clusters.wait_until_ready().await?;
        self.namespaces.wait_until_ready().await?;
        self.services.wait_until_ready().await?;
        self.secrets.wait_until_ready().await?;
        info!("Caches synced");
        Ok(())
    }

    /// Reconcile context reading from these caches
    pub fn context(&self, store: KubeStore, service_account_key_bits: usize) -> Context {
        let services: Arc<dyn Lister<Service>> =
            Arc::new(CachedLister::new(self.services.clone(), "service"));
        let store = Arc::new(store);
        Context {
            clusters: Arc::new(CachedLister::new(self.clusters.clone(), "cluster")),
            namespaces: Arc::new(CachedLister::new(self.namespaces.clone(), "namespace")),
            services: services.clone(),
            secrets: Arc::new(CachedLister::new(self.secrets.clone(), "secret")),
            writer: store.clone(),
            cluster_client: store,
            resolver: Arc::new(LoadBalancerAddressResolver::external_apiserver(services)),
            service_account_key_bits,
        }
    }

    /// Re-enqueue every cached cluster each `period`
    pub fn spawn_resync(&mut self, queue: Arc<RateLimitingQueue>, period: Duration) {
        let clusters = self.clusters.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if queue.is_shutting_down() {
                    break;
                }
                let cached = clusters.state();
                debug!("resyncing {} clusters", cached.len());
                for cluster in cached {
                    queue.add(&object_key(cluster.as_ref()));
                }
            }
        }));
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Informers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
