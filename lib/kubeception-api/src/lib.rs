//! Kubeception API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resources watched by the kubeception
//! controller:
//! - Cluster: a control plane to be hosted inside the management cluster

pub mod v1alpha1;

pub use v1alpha1::{ApiEndpoint, Cluster, ClusterNetworkingConfig, ClusterSpec, ClusterStatus, NetworkRanges};
