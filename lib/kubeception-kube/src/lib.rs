//! Kubernetes adapters for the cluster controller
pub mod client;
pub mod informers;

pub use client::KubeStore;
pub use informers::{CachedLister, Informers};
