//! PKI secrets: the cluster root CA and the apiserver's certificates

use super::{cluster_namespace, created, opaque_secret, AddressResolver};
use crate::cache::{exists, Lister};
use crate::pki::{self, CertificateAuthority, CertKeyPair};
use crate::store::ResourceWriter;
use crate::{CoreError, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kubeception_api::Cluster;
use std::net::IpAddr;

pub const ROOT_CA_SECRET_NAME: &str = "root-ca";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";

pub const APISERVER_TLS_SECRET_NAME: &str = "apiserver-tls";
pub const APISERVER_CERT_KEY: &str = "apiserver.crt";
pub const APISERVER_KEY_KEY: &str = "apiserver.key";

pub const KUBELET_CLIENT_SECRET_NAME: &str = "apiserver-kubelet-client-certs";
pub const KUBELET_CLIENT_CERT_KEY: &str = "kubelet.crt";
pub const KUBELET_CLIENT_KEY_KEY: &str = "kubelet.key";

const APISERVER_ORGANIZATION: &str = "kubeception";

/// Host byte of the in-cluster `kubernetes` service address
const KUBERNETES_SERVICE_IP_LAST_BYTE: u8 = 1;

pub async fn ensure_root_ca_secret_exists(
    cluster: &Cluster,
    secrets: &dyn Lister<Secret>,
    writer: &dyn ResourceWriter,
) -> Result<()> {
    let namespace = cluster_namespace(cluster);
    if exists(secrets, Some(&namespace), ROOT_CA_SECRET_NAME)? {
        return Ok(());
    }

    let ca = pki::new_ca(&format!("{}.{}", ROOT_CA_SECRET_NAME, cluster.name_any()))?;
    let secret = opaque_secret(
        cluster,
        &namespace,
        ROOT_CA_SECRET_NAME,
        [
            (CA_CERT_KEY, ca.cert_pem.into_bytes()),
            (CA_KEY_KEY, ca.key_pem.into_bytes()),
        ],
    );
    created(
        writer.create_secret(&namespace, secret).await,
        "secret",
        &format!("{}/{}", namespace, ROOT_CA_SECRET_NAME),
    )
}

fn secret_entry(secret: &Secret, key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            CoreError::MissingDependency(format!(
                "secret {} has no {} entry",
                secret.name_any(),
                key
            ))
        })?;
    String::from_utf8(value.0.clone()).map_err(|e| {
        CoreError::Crypto(format!("secret {} entry {} is not PEM: {}", secret.name_any(), key, e))
    })
}

/// Load the cluster's root CA from the cache
pub fn load_cluster_ca(cluster: &Cluster, secrets: &dyn Lister<Secret>) -> Result<CertificateAuthority> {
    let namespace = cluster_namespace(cluster);
    let secret = match secrets.get(Some(&namespace), ROOT_CA_SECRET_NAME) {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => {
            return Err(CoreError::MissingDependency(format!(
                "no root ca exists in {} so far",
                namespace
            )))
        }
        Err(e) => return Err(e),
    };

    CertificateAuthority::from_pem(
        &secret_entry(&secret, CA_CERT_KEY)?,
        &secret_entry(&secret, CA_KEY_KEY)?,
    )
}

fn service_cluster_ip(cluster: &Cluster) -> Result<IpAddr> {
    let cidr = cluster.service_cidr().ok_or_else(|| {
        CoreError::InvalidConfiguration(format!(
            "cluster {} has no service cidr block",
            cluster.name_any()
        ))
    })?;
    Ok(pki::compute_cluster_ip(cidr, KUBERNETES_SERVICE_IP_LAST_BYTE)?.into())
}

fn apiserver_dns_names(dns_domain: &str) -> Vec<String> {
    vec![
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", dns_domain),
    ]
}

fn cert_secret(
    cluster: &Cluster,
    namespace: &str,
    name: &str,
    cert_key: &'static str,
    key_key: &'static str,
    pair: CertKeyPair,
) -> Secret {
    opaque_secret(
        cluster,
        namespace,
        name,
        [
            (cert_key, pair.cert_pem.into_bytes()),
            (key_key, pair.key_pem.into_bytes()),
        ],
    )
}

/// Serving certificate of the hosted apiserver
///
/// Valid for the external address and for the first address of the service
/// CIDR, which is where the in-cluster `kubernetes` service lives.
pub async fn ensure_apiserver_tls_secret_exists(
    cluster: &Cluster,
    secrets: &dyn Lister<Secret>,
    writer: &dyn ResourceWriter,
    resolver: &dyn AddressResolver,
) -> Result<()> {
    let namespace = cluster_namespace(cluster);
    if exists(secrets, Some(&namespace), APISERVER_TLS_SECRET_NAME)? {
        return Ok(());
    }

    let ca = load_cluster_ca(cluster, secrets)?;
    let external_ip = resolver.resolve(cluster)?;
    let cluster_ip = service_cluster_ip(cluster)?;

    let pair = pki::new_server_key_pair(
        &ca,
        &external_ip.to_string(),
        APISERVER_ORGANIZATION,
        &cluster.name_any(),
        &apiserver_dns_names(&cluster.spec.cluster_network.dns_domain),
        &[cluster_ip, external_ip],
    )?;
    let secret = cert_secret(
        cluster,
        &namespace,
        APISERVER_TLS_SECRET_NAME,
        APISERVER_CERT_KEY,
        APISERVER_KEY_KEY,
        pair,
    );
    created(
        writer.create_secret(&namespace, secret).await,
        "secret",
        &format!("{}/{}", namespace, APISERVER_TLS_SECRET_NAME),
    )
}

/// Client certificate the apiserver presents to kubelets
pub async fn ensure_apiserver_kubelet_client_secret_exists(
    cluster: &Cluster,
    secrets: &dyn Lister<Secret>,
    writer: &dyn ResourceWriter,
    resolver: &dyn AddressResolver,
) -> Result<()> {
    let namespace = cluster_namespace(cluster);
    if exists(secrets, Some(&namespace), KUBELET_CLIENT_SECRET_NAME)? {
        return Ok(());
    }

    let ca = load_cluster_ca(cluster, secrets)?;
    let external_ip = resolver.resolve(cluster)?;

    let pair = pki::new_client_key_pair(&ca, &external_ip.to_string(), &[external_ip])?;
    let secret = cert_secret(
        cluster,
        &namespace,
        KUBELET_CLIENT_SECRET_NAME,
        KUBELET_CLIENT_CERT_KEY,
        KUBELET_CLIENT_KEY_KEY,
        pair,
    );
    created(
        writer.create_secret(&namespace, secret).await,
        "secret",
        &format!("{}/{}", namespace, KUBELET_CLIENT_SECRET_NAME),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::resources::endpoint::MockAddressResolver;
    use crate::store::MockResourceWriter;
    use kubeception_api::{ClusterNetworkingConfig, ClusterSpec, NetworkRanges};
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

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

    fn resolver_returning(ip: &'static str) -> MockAddressResolver {
        let mut resolver = MockAddressResolver::new();
        resolver
            .expect_resolve()
            .returning(move |_| Ok(ip.parse().unwrap()));
        resolver
    }

    fn entry(store: &InMemoryStore, name: &str, key: &str) -> String {
        let secret = store.secret("cluster-demo", name).unwrap();
        String::from_utf8(secret.data.as_ref().unwrap()[key].0.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_root_ca_secret() {
        let store = InMemoryStore::new();
        ensure_root_ca_secret_exists(&cluster(), &store, &store).await.unwrap();

        let secret = store.secret("cluster-demo", ROOT_CA_SECRET_NAME).unwrap();
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));

        let cert_pem = entry(&store, ROOT_CA_SECRET_NAME, CA_CERT_KEY);
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert.is_ca());
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "root-ca.demo");

        // Loadable as issuer
        load_cluster_ca(&cluster(), &store).unwrap();
    }

    #[tokio::test]
    async fn test_root_ca_is_never_regenerated() {
        let store = InMemoryStore::new();
        ensure_root_ca_secret_exists(&cluster(), &store, &store).await.unwrap();
        let before = entry(&store, ROOT_CA_SECRET_NAME, CA_CERT_KEY);

        let mut writer = MockResourceWriter::new();
        writer.expect_create_secret().never();
        ensure_root_ca_secret_exists(&cluster(), &store, &writer).await.unwrap();
        assert_eq!(entry(&store, ROOT_CA_SECRET_NAME, CA_CERT_KEY), before);
    }

    #[tokio::test]
    async fn test_unlabelled_root_ca_is_reused() {
        let store = InMemoryStore::new();
        let ca = pki::new_ca("root-ca.demo").unwrap();
        let mut existing = opaque_secret(
            &cluster(),
            "cluster-demo",
            ROOT_CA_SECRET_NAME,
            [
                (CA_CERT_KEY, ca.cert_pem.clone().into_bytes()),
                (CA_KEY_KEY, ca.key_pem.into_bytes()),
            ],
        );
        existing.metadata.labels = None;
        store.create_secret("cluster-demo", existing).await.unwrap();

        let mut writer = MockResourceWriter::new();
        writer.expect_create_secret().never();
        ensure_root_ca_secret_exists(&cluster(), &store, &writer).await.unwrap();
        load_cluster_ca(&cluster(), &store).unwrap();
        assert_eq!(entry(&store, ROOT_CA_SECRET_NAME, CA_CERT_KEY), ca.cert_pem);
    }

    #[tokio::test]
    async fn test_apiserver_tls_secret() {
        let store = InMemoryStore::new();
        ensure_root_ca_secret_exists(&cluster(), &store, &store).await.unwrap();
        ensure_apiserver_tls_secret_exists(
            &cluster(),
            &store,
            &store,
            &resolver_returning("203.0.113.10"),
        )
        .await
        .unwrap();

        let cert_pem = entry(&store, APISERVER_TLS_SECRET_NAME, APISERVER_CERT_KEY);
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();

        let subject = cert.subject();
        assert_eq!(
            subject.iter_common_name().next().unwrap().as_str().unwrap(),
            "203.0.113.10"
        );
        assert_eq!(
            subject.iter_organization().next().unwrap().as_str().unwrap(),
            "kubeception"
        );
        assert_eq!(
            subject
                .iter_organizational_unit()
                .next()
                .unwrap()
                .as_str()
                .unwrap(),
            "demo"
        );

        let sans = cert.subject_alternative_name().unwrap().unwrap();
        let mut dns = vec![];
        let mut ips = vec![];
        for name in &sans.value.general_names {
            match name {
                GeneralName::DNSName(name) => dns.push(name.to_string()),
                GeneralName::IPAddress(bytes) => ips.push(bytes.to_vec()),
                _ => {}
            }
        }
        assert_eq!(
            dns,
            vec![
                "kubernetes",
                "kubernetes.default",
                "kubernetes.default.svc",
                "kubernetes.default.svc.cluster.local",
            ]
        );
        assert_eq!(ips, vec![vec![10, 0, 0, 1], vec![203, 0, 113, 10]]);

        assert!(!entry(&store, APISERVER_TLS_SECRET_NAME, APISERVER_KEY_KEY).is_empty());
    }

    #[tokio::test]
    async fn test_kubelet_client_secret() {
        let store = InMemoryStore::new();
        ensure_root_ca_secret_exists(&cluster(), &store, &store).await.unwrap();
        ensure_apiserver_kubelet_client_secret_exists(
            &cluster(),
            &store,
            &store,
            &resolver_returning("203.0.113.10"),
        )
        .await
        .unwrap();

        let cert_pem = entry(&store, KUBELET_CLIENT_SECRET_NAME, KUBELET_CLIENT_CERT_KEY);
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert_eq!(
            cert.subject()
                .iter_common_name()
                .next()
                .unwrap()
                .as_str()
                .unwrap(),
            "203.0.113.10"
        );
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);
    }

    #[tokio::test]
    async fn test_leaf_certificates_require_root_ca() {
        let store = InMemoryStore::new();
        let resolver = resolver_returning("203.0.113.10");

        let err = ensure_apiserver_kubelet_client_secret_exists(&cluster(), &store, &store, &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingDependency(_)), "{}", err);

        let err = ensure_apiserver_tls_secret_exists(&cluster(), &store, &store, &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingDependency(_)), "{}", err);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_apiserver_tls_waits_for_address() {
        let store = InMemoryStore::new();
        ensure_root_ca_secret_exists(&cluster(), &store, &store).await.unwrap();

        let mut resolver = MockAddressResolver::new();
        resolver.expect_resolve().returning(|_| {
            Err(CoreError::AddressNotYetAvailable {
                service: "cluster-demo/apiserver-external".to_string(),
            })
        });

        let err = ensure_apiserver_tls_secret_exists(&cluster(), &store, &store, &resolver)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.secret("cluster-demo", APISERVER_TLS_SECRET_NAME).is_none());
    }

    #[tokio::test]
    async fn test_apiserver_tls_requires_service_cidr() {
        let store = InMemoryStore::new();
        let cluster = Cluster::new("demo", Default::default());
        ensure_root_ca_secret_exists(&cluster, &store, &store).await.unwrap();

        let err = ensure_apiserver_tls_secret_exists(
            &cluster,
            &store,
            &store,
            &resolver_returning("203.0.113.10"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration(_)), "{}", err);
    }
}
