//! Error types for the kunit operator
//!
//! Errors carry the object they concern so that a failed reconcile can be
//! traced back to a Unit or UnitSet from the logs alone. Partial failures of
//! concurrent sub-resource work are folded into [`Error::Aggregate`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kunit operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid spec on a Unit or UnitSet
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
    },

    /// A precondition for convergence is not met and needs manual resolution
    #[error("precondition failed for {object}: {message}")]
    Precondition {
        /// Name of the object being reconciled
        object: String,
        /// Description of the unmet precondition
        message: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Description of the state when the wait gave up
        message: String,
    },

    /// The wait was abandoned because the reconcile was cancelled
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited on
        operation: String,
    },

    /// Sidecar agent call failed
    #[error("agent error for unit {unit}: {message}")]
    Agent {
        /// Unit whose agent was called
        unit: String,
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
        /// Context where the error occurred
        context: String,
        /// Whether the outer reconcile should retry
        retryable: bool,
    },

    /// Several independent sub-resource operations failed
    #[error("{context}: {} error(s): {}", errors.len(), join_messages(errors))]
    Aggregate {
        /// Operation that fanned out
        context: String,
        /// Every collected error, in completion order
        errors: Vec<Error>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error for the named object
    pub fn validation(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a precondition error for the named object
    pub fn precondition(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Precondition {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an agent error
    pub fn agent(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Agent {
            unit: unit.into(),
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
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
            retryable: true,
        }
    }

    /// Create an internal error the outer reconcile must not retry blindly
    pub fn internal_permanent(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
            retryable: false,
        }
    }

    /// Fold a list of errors into one result.
    ///
    /// Empty lists are success, a single error is returned unwrapped, and
    /// anything more becomes [`Error::Aggregate`].
    pub fn aggregate(context: impl Into<String>, mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate {
                context: context.into(),
                errors,
            }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and precondition errors need a human; everything else is
    /// expected to clear up on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Precondition { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Agent { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { retryable, .. } => *retryable,
            Error::Aggregate { errors, .. } => errors.iter().any(Error::is_retryable),
        }
    }

    /// True when this is an API conflict (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when this is an API not-found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Get the object name if this error is associated with one
    pub fn object(&self) -> Option<&str> {
        match self {
            Error::Validation { object, .. } => Some(object),
            Error::Precondition { object, .. } => Some(object),
            Error::Agent { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
