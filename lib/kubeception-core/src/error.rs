use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("no external address assigned to service {service} yet")]
    AddressNotYetAvailable { service: String },

    #[error("dependency missing: {0}")]
    MissingDependency(String),

    #[error("Invalid cluster configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("failed to ensure {step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn already_exists(kind: &'static str, key: impl Into<String>) -> Self {
        CoreError::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    /// Wrap an error with the name of the reconcile step that produced it
    pub fn in_step(self, step: &'static str) -> Self {
        CoreError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, with step wrappers peeled off
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), CoreError::AlreadyExists { .. })
    }

    /// Failures that are expected to clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), CoreError::AddressNotYetAvailable { .. })
    }
}
