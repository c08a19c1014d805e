//! Control-plane reconciliation for hosted Kubernetes clusters
//!
//! This library provides:
//! - Ensurers creating the namespace, endpoint service and secrets of a cluster
//! - PKI helpers for the cluster CA and apiserver certificates
//! - A rate-limited work queue and the worker pool draining it
//! - Three-way merge patches for persisting Cluster status
//!
//! Access to the object store goes through the [`cache::Lister`],
//! [`store::ResourceWriter`] and [`store::ClusterClient`] traits, so the
//! same code runs against a real API server and against [`memory::InMemoryStore`].

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod patch;
pub mod pki;
pub mod queue;
pub mod resources;
pub mod store;

pub use controller::ClusterController;
pub use error::{CoreError, Result};
pub use orchestrator::{ensure_cluster_resources_exist, Context};
