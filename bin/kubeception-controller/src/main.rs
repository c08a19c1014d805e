use anyhow::Result;
use clap::{Parser, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResourceExt};
use kubeception_api::v1alpha1::API_GROUP;
use kubeception_api::Cluster;
use kubeception_core::config::{ControllerConfig, QueueConfig};
use kubeception_core::metrics::ControllerMetrics;
use kubeception_core::queue::RateLimitingQueue;
use kubeception_core::ClusterController;
use kubeception_kube::client::FIELD_MANAGER;
use kubeception_kube::{Informers, KubeStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod metrics_server;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Hosts Kubernetes control planes inside this cluster
#[derive(Parser, Debug)]
#[command(name = "kubeception-controller", version)]
struct Args {
    /// Path to a kubeconfig; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address of the API server, overrides the kubeconfig
    #[arg(long)]
    master: Option<String>,

    /// Number of parallel reconcile workers
    #[arg(long, default_value_t = 5)]
    worker_count: usize,

    /// Seconds between full re-enqueues of all cached clusters
    #[arg(long, default_value_t = 30)]
    resync_period_secs: u64,

    /// Retry delay after the first failure of a cluster, in milliseconds
    #[arg(long, default_value_t = 5)]
    backoff_base_ms: u64,

    /// Upper bound of the per-cluster retry delay, in seconds
    #[arg(long, default_value_t = 10)]
    backoff_max_secs: u64,

    /// Sustained retry rate across all clusters
    #[arg(long, default_value_t = 10.0)]
    bucket_qps: f64,

    /// Retries allowed in a burst
    #[arg(long, default_value_t = 100)]
    bucket_burst: u32,

    /// Size of generated service account signing keys
    #[arg(long, default_value_t = 4096)]
    service_account_key_bits: usize,

    /// Listen address of the metrics and health endpoint
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Install or update the Cluster CRD before starting
    #[arg(long)]
    install_crd: bool,

    /// Print the Cluster CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.worker_count,
            queue: QueueConfig {
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_secs(self.backoff_max_secs),
                bucket_qps: self.bucket_qps,
                bucket_burst: self.bucket_burst,
            },
            service_account_key_bits: self.service_account_key_bits,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn kube_client(args: &Args) -> Result<Client> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    if let Some(master) = &args.master {
        config.cluster_url = master.parse()?;
    }
    Ok(Client::try_from(config)?)
}

async fn install_crd(client: Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let name = format!("clusters.{}", API_GROUP);
    crds.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&Cluster::crd()),
    )
    .await?;
    info!("Installed CRD {}", name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&Cluster::crd())?);
        return Ok(());
    }

    init_tracing(args.log_format);
    info!("Starting kubeception-controller...");

    let config = args.controller_config();
    let client = kube_client(&args).await?;
    if args.install_crd {
        install_crd(client.clone()).await?;
    }

    let metrics = ControllerMetrics::new()?;
    let metrics_addr = args.metrics_addr;
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server::serve(metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let queue = Arc::new(RateLimitingQueue::with_config(&config.queue));
    let mut informers = Informers::start(client.clone(), queue.clone());
    info!("Waiting for caches to sync");
    informers.wait_until_ready().await?;
    informers.spawn_resync(queue.clone(), Duration::from_secs(args.resync_period_secs));

    let ctx = informers.context(KubeStore::new(client), config.service_account_key_bits);
    let controller = Arc::new(ClusterController::new(queue, ctx, metrics));

    controller
        .run(config.workers, async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, exiting..."),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        })
        .await;

    informers.shutdown();
    Ok(())
}
