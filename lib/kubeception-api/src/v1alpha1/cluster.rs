use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster describes a control plane that should be provisioned inside
/// this management cluster
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    derive = "Default",
    derive = "PartialEq",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoints[0].host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Network layout of the cluster
    pub cluster_network: ClusterNetworkingConfig,

    /// Provider specific configuration, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,
}

/// Network ranges and DNS settings of a cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkingConfig {
    /// Network ranges from which service VIPs are allocated
    pub services: NetworkRanges,

    /// Network ranges from which pod IPs are allocated
    #[serde(default)]
    pub pods: NetworkRanges,

    /// Domain name for services
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
}

impl Default for ClusterNetworkingConfig {
    fn default() -> Self {
        Self {
            services: NetworkRanges::default(),
            pods: NetworkRanges::default(),
            dns_domain: default_dns_domain(),
        }
    }
}

/// A list of CIDR blocks
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Endpoints under which the cluster's API server is reachable
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// Machine readable reason of a terminal problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human readable description of a terminal problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Provider specific status, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,
}

/// Address of an API server
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

impl Cluster {
    /// First service CIDR block, the one VIPs are computed from
    pub fn service_cidr(&self) -> Option<&str> {
        self.spec
            .cluster_network
            .services
            .cidr_blocks
            .first()
            .map(String::as_str)
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

fn default_dns_domain() -> String {
    "cluster.local".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterNetwork": {
                "services": { "cidrBlocks": ["10.0.0.0/16"] }
            }
        }))
        .unwrap();

        assert_eq!(spec.cluster_network.dns_domain, "cluster.local");
        assert!(spec.cluster_network.pods.cidr_blocks.is_empty());
        assert!(spec.provider_config.is_none());
    }

    #[test]
    fn test_service_cidr_uses_first_block() {
        let mut cluster = Cluster::new("demo", ClusterSpec::default());
        assert_eq!(cluster.service_cidr(), None);

        cluster.spec.cluster_network.services.cidr_blocks =
            vec!["10.0.0.0/16".to_string(), "10.1.0.0/16".to_string()];
        assert_eq!(cluster.service_cidr(), Some("10.0.0.0/16"));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ClusterStatus {
            api_endpoints: vec![ApiEndpoint {
                host: "203.0.113.10".to_string(),
                port: 6443,
            }],
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["apiEndpoints"][0]["host"], "203.0.113.10");
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = Cluster::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "cluster.k8s.io");
    }
}
