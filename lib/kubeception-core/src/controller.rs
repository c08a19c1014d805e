//! Cluster controller: a pool of workers draining the rate-limited queue

use crate::cache::split_key;
use crate::metrics::{ControllerMetrics, ReconcileResult};
use crate::orchestrator::{ensure_cluster_resources_exist, Context};
use crate::patch::patch_cluster;
use crate::queue::RateLimitingQueue;
use crate::resources::endpoint::APISERVER_PORT;
use crate::{CoreError, Result};
use kubeception_api::{ApiEndpoint, Cluster};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct ClusterController {
    queue: Arc<RateLimitingQueue>,
    ctx: Context,
    metrics: ControllerMetrics,
}

impl ClusterController {
    pub fn new(queue: Arc<RateLimitingQueue>, ctx: Context, metrics: ControllerMetrics) -> Self {
        Self {
            queue,
            ctx,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue> {
        &self.queue
    }

    /// Run `workers` reconcile workers until `shutdown` resolves
    ///
    /// On shutdown the queue is closed and in-flight passes are allowed to
    /// finish before this returns.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: impl Future<Output = ()>) {
        info!("Starting {} cluster workers", workers);
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let controller = self.clone();
            tasks.spawn(async move {
                while controller.process_next_work_item().await {}
                debug!(worker, "cluster worker stopped");
            });
        }

        shutdown.await;
        info!("Shutting down cluster workers");
        self.queue.shut_down();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("cluster worker panicked: {}", e);
            }
        }
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Returns false once the queue has been shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.queue_depth.set(self.queue.len() as i64);

        let started = Instant::now();
        let result = match self.sync_handler(&key).await {
            Ok(result) => {
                self.queue.forget(&key);
                result
            }
            Err(e) => {
                let retries = self.queue.num_requeues(&key);
                let result = failure_result(&e);
                match result {
                    ReconcileResult::Transient => {
                        warn!(cluster = %key, retries, "cluster not ready yet, requeueing: {}", e)
                    }
                    _ => error!(cluster = %key, retries, "error syncing cluster: {}", e),
                }
                self.queue.add_with_backoff(&key);
                result
            }
        };
        self.metrics.record(result, started.elapsed());
        self.queue.done(&key);
        true
    }

    /// One reconcile pass for the cluster behind `key`
    pub async fn sync_handler(&self, key: &str) -> Result<ReconcileResult> {
        let (namespace, name) = split_key(key)?;
        let cluster = match self.ctx.clusters.get(namespace, name) {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                debug!("cluster {} in work queue no longer exists", key);
                return Ok(ReconcileResult::Tombstone);
            }
            Err(e) => return Err(e),
        };

        debug!(cluster = %key, "syncing cluster");
        ensure_cluster_resources_exist(&cluster, &self.ctx).await?;
        self.record_api_endpoint(&cluster).await?;
        Ok(ReconcileResult::Success)
    }

    async fn record_api_endpoint(&self, cluster: &Cluster) -> Result<()> {
        let address = self
            .ctx
            .resolver
            .resolve(cluster)
            .map_err(|e| e.in_step("external apiserver address"))?;

        let mut intended = cluster.clone();
        intended.status.get_or_insert_with(Default::default).api_endpoints = vec![ApiEndpoint {
            host: address.to_string(),
            port: APISERVER_PORT,
        }];

        patch_cluster(self.ctx.cluster_client.as_ref(), cluster, &intended)
            .await
            .map_err(|e| e.in_step("cluster status"))?;
        Ok(())
    }
}

fn failure_result(error: &CoreError) -> ReconcileResult {
    if error.is_transient() {
        ReconcileResult::Transient
    } else {
        ReconcileResult::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::memory::InMemoryStore;
    use crate::resources::endpoint::EXTERNAL_APISERVER_SERVICE_NAME;
    use kubeception_api::{ClusterNetworkingConfig, ClusterSpec, NetworkRanges};
    use std::time::Duration;

    fn cluster() -> Cluster {
        Cluster::new(
            "demo",
            ClusterSpec {
                cluster_network: ClusterNetworkingConfig {
                    services: NetworkRanges {
                        cidr_blocks: vec!["10.0.0.0/16".to_string()],
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn controller(store: &Arc<InMemoryStore>) -> ClusterController {
        let queue = Arc::new(RateLimitingQueue::with_config(&QueueConfig {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
            ..Default::default()
        }));
        ClusterController::new(queue, store.context(2048), ControllerMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_forgotten() {
        let store = Arc::new(InMemoryStore::new());
        let controller = controller(&store);
        controller.queue().add("gone");

        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues("gone"), 0);
        assert!(controller.queue().is_empty());
        assert_eq!(store.writes(), 0);
        assert_eq!(
            controller
                .metrics
                .reconcile_total
                .with_label_values(&["tombstone"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_cluster(cluster());
        let controller = controller(&store);
        controller.queue().add("demo");

        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues("demo"), 1);
        assert_eq!(controller.metrics.queue_retries_total.get(), 1);

        // The key comes back after its backoff
        let key = tokio::time::timeout(Duration::from_secs(1), controller.queue().get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn test_success_records_endpoint_and_forgets_key() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_cluster(cluster());
        let controller = controller(&store);

        controller.sync_handler("demo").await.unwrap_err();
        store.set_load_balancer_ip("cluster-demo", EXTERNAL_APISERVER_SERVICE_NAME, "203.0.113.10");

        controller.queue().add("demo");
        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues("demo"), 0);

        let status = store.cluster("demo").unwrap().status.clone().unwrap();
        assert_eq!(
            status.api_endpoints,
            vec![ApiEndpoint {
                host: "203.0.113.10".to_string(),
                port: 6443
            }]
        );
    }

    #[tokio::test]
    async fn test_converged_cluster_causes_no_writes() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_cluster(cluster());
        let controller = controller(&store);
        let _ = controller.sync_handler("demo").await;
        store.set_load_balancer_ip("cluster-demo", EXTERNAL_APISERVER_SERVICE_NAME, "203.0.113.10");
        controller.sync_handler("demo").await.unwrap();

        let writes = store.writes();
        assert_eq!(
            controller.sync_handler("demo").await.unwrap(),
            ReconcileResult::Success
        );
        assert_eq!(store.writes(), writes);
    }

    #[test]
    fn test_failures_are_classified_for_logging() {
        let waiting = CoreError::AddressNotYetAvailable {
            service: "cluster-demo/apiserver-external".to_string(),
        }
        .in_step("external apiserver address");
        assert_eq!(failure_result(&waiting), ReconcileResult::Transient);

        let broken = CoreError::Internal("connection refused".to_string()).in_step("cluster namespace");
        assert_eq!(failure_result(&broken), ReconcileResult::Error);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let controller = Arc::new(controller(&store));
        controller.queue().add("gone");

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(controller.clone().run(2, async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(controller.queue().is_shutting_down());
    }
}
