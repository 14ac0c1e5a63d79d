//! Error types for the reconciliation engine
//!
//! Every fatal condition of a reconciliation maps to one variant here. Only
//! [`Error::TransientApi`] is retried internally; everything else aborts the
//! running operation and is returned to the caller, usually wrapped in
//! [`Error::Step`] so the failing sub-resource and operation are visible.

use thiserror::Error;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the reconciliation engine
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or a request the provider refused as invalid
    /// (empty port list, unsupported protocol, quota exceeded, bad subnet)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Rate limiting, connection reset or a 5xx-class provider response
    #[error("Transient API error: {0}")]
    TransientApi(String),

    /// Ambiguous identity resolution or a concurrent external modification
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// The provider moved a resource into ERROR provisioning status
    #[error("Provisioning failed: {resource} entered ERROR status")]
    Provisioning {
        /// Resource that failed
        resource: String,
    },

    /// The shared deadline expired while a resource was still transitioning
    #[error("Provisioning timed out waiting for {resource}")]
    ProvisioningTimeout {
        /// Resource that was being waited on
        resource: String,
    },

    /// The load balancer is ACTIVE but exposes no address
    #[error("Address unavailable: load balancer {0} has neither a floating nor a virtual address")]
    AddressUnavailable(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A failure annotated with the operation and sub-resource it happened on
    #[error("{operation} {resource}: {source}")]
    Step {
        /// Operation being performed (e.g. "create pool")
        operation: String,
        /// Sub-resource the operation targeted
        resource: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transient API error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientApi(msg.into())
    }

    /// Create a resource conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ResourceConflict(msg.into())
    }

    /// Create a provisioning (ERROR status) error
    pub fn provisioning(resource: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
        }
    }

    /// Create a provisioning timeout error
    pub fn timeout(resource: impl Into<String>) -> Self {
        Self::ProvisioningTimeout {
            resource: resource.into(),
        }
    }

    /// Create an address unavailable error
    pub fn address_unavailable(lb: impl Into<String>) -> Self {
        Self::AddressUnavailable(lb.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Attach the operation and sub-resource this error occurred on
    ///
    /// Errors that already carry step context are returned unchanged so the
    /// innermost (most precise) context wins.
    pub fn in_step(self, operation: impl Into<String>, resource: impl Into<String>) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                operation: operation.into(),
                resource: resource.into(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any step context removed
    pub fn root(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error may succeed if the same call is issued again
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Self::TransientApi(_))
    }

    /// Whether this error is a `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
