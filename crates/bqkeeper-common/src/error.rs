//! Error types for the bqkeeper operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Remote failures carry the project and dataset they concern so that a
//! single log line is enough to locate the offending BigQuery resource.

use thiserror::Error;

/// Main error type for bqkeeper operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Validation error for a BigQueryDataset spec
    #[error("validation error for {dataset}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        dataset: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.project")
        field: Option<String>,
    },

    /// The remote dataset already exists (create conflict)
    #[error("dataset {project}:{dataset} already exists")]
    AlreadyExists {
        /// Google Cloud project
        project: String,
        /// BigQuery dataset id
        dataset: String,
    },

    /// The remote dataset does not exist
    #[error("dataset {project}:{dataset} not found")]
    NotFound {
        /// Google Cloud project
        project: String,
        /// BigQuery dataset id
        dataset: String,
    },

    /// The concurrency token sent with an update no longer matches
    #[error("dataset {project}:{dataset} was modified concurrently (etag mismatch)")]
    StaleEtag {
        /// Google Cloud project
        project: String,
        /// BigQuery dataset id
        dataset: String,
    },

    /// Any other failure talking to the remote API
    #[error("bigquery error for {project}:{dataset}: {message}")]
    Remote {
        /// Google Cloud project
        project: String,
        /// BigQuery dataset id
        dataset: String,
        /// Description of what failed
        message: String,
        /// Whether this error is worth retrying (network, throttling, 5xx)
        retryable: bool,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "token", "controller")
        context: String,
    },
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        dataset: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            dataset: dataset.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self::AlreadyExists {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self::NotFound {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Create a stale-etag error
    pub fn stale_etag(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self::StaleEtag {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Create a retryable remote error
    pub fn remote(
        project: impl Into<String>,
        dataset: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Remote {
            project: project.into(),
            dataset: dataset.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable remote error (e.g., permission denied, bad request)
    pub fn remote_permanent(
        project: impl Into<String>,
        dataset: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Remote {
            project: project.into(),
            dataset: dataset.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if the remote reported that the dataset already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if the remote reported that the dataset does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change to resolve.
    /// Kubernetes errors are retried except for client-side 4xx responses
    /// other than conflicts, which resolve with a fresh object.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Self::Serialization { .. } | Self::Validation { .. } => false,
            Self::AlreadyExists { .. } | Self::NotFound { .. } | Self::StaleEtag { .. } => true,
            Self::Remote { retryable, .. } => *retryable,
            Self::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_carry_location() {
        let err = Error::remote("team-project", "events", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("team-project:events"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn permanent_remote_errors_are_not_retryable() {
        let err = Error::remote_permanent("p", "d", "access denied");
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_and_serialization_are_not_retryable() {
        assert!(!Error::validation_for_field("ds", "spec.project", "empty").is_retryable());
        assert!(!Error::serialization("bad input").is_retryable());
    }

    #[test]
    fn outcome_predicates() {
        assert!(Error::already_exists("p", "d").is_already_exists());
        assert!(!Error::already_exists("p", "d").is_not_found());
        assert!(Error::not_found("p", "d").is_not_found());
        assert!(!Error::stale_etag("p", "d").is_not_found());
    }

    #[test]
    fn stale_etag_is_retryable() {
        let err = Error::stale_etag("p", "d");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("etag"));
    }

    #[test]
    fn kube_conflict_is_retryable() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_retryable());
    }

    #[test]
    fn kube_forbidden_is_not_retryable() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn serde_json_errors_convert_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
