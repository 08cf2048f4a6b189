//! Error types for the fleet controller
//!
//! Bootstrap failures (connection, registration, startup, leadership) carry the
//! name of the domain, control loop or starter that failed so the single fatal
//! log line at process exit says where things went wrong.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Connection or resource-domain client construction failed
    #[error("connection error [{domain}]: {message}")]
    Connection {
        /// Resource domain (or "config") that could not be reached
        domain: String,
        /// Description of what failed
        message: String,
    },

    /// A control loop refused to register
    #[error("registration error [{controller}]: {message}")]
    Registration {
        /// Name of the control loop
        controller: String,
        /// Description of what failed
        message: String,
    },

    /// A starter failed to start or sync its caches
    #[error("startup error [{starter}]: {message}")]
    Startup {
        /// Name of the starter
        starter: String,
        /// Description of what failed
        message: String,
    },

    /// The controller lease was lost while running
    #[error("leadership lost by {identity}")]
    LeadershipLost {
        /// Identity of the replica that lost the lease
        identity: String,
    },

    /// The operation was cancelled by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Server-side apply or prune of a desired object failed
    #[error("apply error for {kind}/{name}: {message}")]
    Apply {
        /// Kind of the object
        kind: String,
        /// Name of the object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "leader-election", "informer")
        context: String,
    },
}

impl Error {
    /// Create a connection error for a resource domain
    pub fn connection(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            domain: domain.into(),
            message: msg.into(),
        }
    }

    /// Create a registration error for a control loop
    pub fn registration(controller: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            controller: controller.into(),
            message: msg.into(),
        }
    }

    /// Create a startup error for a starter
    pub fn startup(starter: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Startup {
            starter: starter.into(),
            message: msg.into(),
        }
    }

    /// Create a leadership-lost error
    pub fn leadership_lost(identity: impl Into<String>) -> Self {
        Self::LeadershipLost {
            identity: identity.into(),
        }
    }

    /// Create an apply error for a single object
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Bootstrap-phase errors are never retried in-process: they terminate the
    /// controller and the supervisor restarts it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Apply { .. } => true,
            Error::Internal { .. } => true,
            Error::Serialization { .. } => false,
            Error::Connection { .. }
            | Error::Registration { .. }
            | Error::Startup { .. }
            | Error::LeadershipLost { .. }
            | Error::Cancelled => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
