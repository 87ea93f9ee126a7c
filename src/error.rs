//! Error types for the ingress controller

use thiserror::Error;

use crate::haproxy::ClientError;

#[derive(Error, Debug)]
pub enum Error {
    /// Environment could not be prepared; the process cannot continue
    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// Starting or committing a transaction against the proxy failed
    #[error("Transaction error: {0}")]
    TransactionError(#[source] ClientError),

    /// A single object operation inside a transaction failed
    #[error("HAProxy client error: {0}")]
    ClientError(#[from] ClientError),

    /// Malformed annotation value
    #[error("Annotation {annotation}: {message}")]
    AnnotationError { annotation: String, message: String },

    /// The default backend override could not be resolved
    #[error("Default backend error: {0}")]
    DefaultBackendError(String),

    /// Reload, restart or start of the proxy process failed
    #[error("Service control error: {0}")]
    ServiceControlError(String),

    /// Rejected low-level proxy rule
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub fn annotation<A: Into<String>, M: Into<String>>(annotation: A, message: M) -> Self {
        Self::AnnotationError {
            annotation: annotation.into(),
            message: message.into(),
        }
    }

    /// Whether the next sync cycle can be expected to succeed where this one failed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::TransactionError(_) | Error::ServiceControlError(_) | Error::IoError(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
