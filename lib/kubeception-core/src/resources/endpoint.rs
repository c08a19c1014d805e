//! External apiserver endpoint
//!
//! The hosted apiserver is reached through a LoadBalancer service in the
//! cluster namespace. Its ingress address is what ends up in certificates
//! and in the Cluster status.

use super::{cluster_namespace, cluster_object_meta, created};
use crate::cache::{exists, Lister};
use crate::store::ResourceWriter;
use crate::{CoreError, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kubeception_api::Cluster;
#[cfg(test)]
use mockall::automock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

pub const EXTERNAL_APISERVER_SERVICE_NAME: &str = "apiserver-external";
pub const APISERVER_PORT_NAME: &str = "apiserver-tls";
pub const APISERVER_PORT: i32 = 6443;

/// Finds the externally reachable address of a cluster's apiserver
#[cfg_attr(test, automock)]
pub trait AddressResolver: Send + Sync {
    /// Fails with [`CoreError::AddressNotYetAvailable`] while the address is
    /// still being provisioned
    fn resolve(&self, cluster: &Cluster) -> Result<IpAddr>;
}

/// Resolves the address from the ingress status of the external service
pub struct LoadBalancerAddressResolver {
    services: Arc<dyn Lister<Service>>,
    service_name: String,
}

impl LoadBalancerAddressResolver {
    pub fn new(services: Arc<dyn Lister<Service>>, service_name: impl Into<String>) -> Self {
        Self {
            services,
            service_name: service_name.into(),
        }
    }

    pub fn external_apiserver(services: Arc<dyn Lister<Service>>) -> Self {
        Self::new(services, EXTERNAL_APISERVER_SERVICE_NAME)
    }
}

impl AddressResolver for LoadBalancerAddressResolver {
    fn resolve(&self, cluster: &Cluster) -> Result<IpAddr> {
        let namespace = cluster_namespace(cluster);
        let service = self.services.get(Some(&namespace), &self.service_name)?;

        let ingress = service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref());

        // Hostname-only ingress entries carry no address we could sign for
        let ip = ingress
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ip.as_deref())
            .find(|ip| !ip.is_empty());

        match ip {
            Some(ip) => ip.parse().map_err(|e| {
                CoreError::Internal(format!(
                    "service {}/{} has invalid ingress ip {:?}: {}",
                    namespace, self.service_name, ip, e
                ))
            }),
            None => Err(CoreError::AddressNotYetAvailable {
                service: format!("{}/{}", namespace, self.service_name),
            }),
        }
    }
}

fn external_apiserver_service(cluster: &Cluster, namespace: &str) -> Service {
    Service {
        metadata: cluster_object_meta(cluster, EXTERNAL_APISERVER_SERVICE_NAME, Some(namespace)),
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(APISERVER_PORT_NAME.to_string()),
                port: APISERVER_PORT,
                target_port: Some(IntOrString::Int(APISERVER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                "apiserver".to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub async fn ensure_external_apiserver_service_exists(
    cluster: &Cluster,
    services: &dyn Lister<Service>,
    writer: &dyn ResourceWriter,
) -> Result<()> {
    let namespace = cluster_namespace(cluster);
    if exists(services, Some(&namespace), EXTERNAL_APISERVER_SERVICE_NAME)? {
        return Ok(());
    }

    let service = external_apiserver_service(cluster, &namespace);
    created(
        writer.create_service(&namespace, service).await,
        "service",
        &format!("{}/{}", namespace, EXTERNAL_APISERVER_SERVICE_NAME),
    )
}
