/// API version v1alpha1 for the cluster API CRDs

pub mod cluster;

pub use cluster::{ApiEndpoint, Cluster, ClusterNetworkingConfig, ClusterSpec, ClusterStatus, NetworkRanges};

/// API group for cluster resources
pub const API_GROUP: &str = "cluster.k8s.io";
/// API version for cluster resources
pub const API_VERSION: &str = "v1alpha1";
