//! Error types for the draftlm serving subsystem.

use std::fmt;
use std::result;
use std::sync::Arc;
use thiserror::Error;

use crate::models::Quantization;

/// A specialized Result type for draftlm operations.
pub type Result<T> = result::Result<T, Error>;

/// Execution tier a backend attempt ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendTier {
    /// GPU-resident execution
    Gpu,
    /// CPU-bound execution, last rung of the fallback ladder
    Cpu,
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTier::Gpu => write!(f, "gpu"),
            BackendTier::Cpu => write!(f, "cpu"),
        }
    }
}

/// Stage of the pipeline an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Manifest,
    Acquisition,
    Preflight,
    Construction,
    Verification,
    Generation,
    Configuration,
}

/// The error type for draftlm operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error for {url}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Network {
        url: String,
        status: Option<u16>,
        transient: bool,
        message: String,
    },

    #[error("GPU unavailable: {0}")]
    Capability(String),

    #[error("Cache storage error: {0}")]
    Cache(String),

    #[error("Cache verification failed for {model}: missing {missing:?}")]
    Integrity { model: String, missing: Vec<String> },

    #[error("Model {model} was loaded from a guessed shard manifest that did not hold up: {reason}")]
    GuessedManifest { model: String, reason: String },

    #[error("Image input failed: {0}")]
    Multimodal(String),

    #[error("Manifest resolution failed: {0}")]
    Manifest(String),

    #[error("{tier} backend failed for {quantization}: {message}")]
    Backend {
        tier: BackendTier,
        quantization: Quantization,
        message: String,
    },

    #[error("No backend could load {model} after {attempts} attempt(s)")]
    NoBackendAvailable { model: String, attempts: usize },

    #[error("Load of {0} was superseded by a model switch or dispose")]
    Superseded(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No model is loaded")]
    ModelNotLoaded,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Tensor error: {0}")]
    Tensor(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Create a network error; server errors and failures without a status
    /// are transient
    pub fn network<U: Into<String>, M: Into<String>>(url: U, status: Option<u16>, message: M) -> Self {
        let transient = status.map(|s| (500..600).contains(&s)).unwrap_or(true);
        Error::Network {
            url: url.into(),
            status,
            transient,
            message: message.into(),
        }
    }

    /// Create a cache storage error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        Error::Cache(msg.into())
    }

    /// Create a tensor error
    pub fn tensor<S: Into<String>>(msg: S) -> Self {
        Error::Tensor(msg.into())
    }

    /// Unwrap errors fanned out by the request de-duplicator
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Error::Network { transient: true, .. })
    }

    /// Pipeline stage this error belongs to
    pub fn stage(&self) -> Stage {
        match self.root() {
            Error::Manifest(_) | Error::UnknownModel(_) => Stage::Manifest,
            Error::Network { .. } | Error::Cache(_) | Error::Io(_) => Stage::Acquisition,
            Error::Capability(_) => Stage::Preflight,
            Error::Backend { .. } | Error::NoBackendAvailable { .. } | Error::Superseded(_) => {
                Stage::Construction
            }
            Error::Integrity { .. } | Error::GuessedManifest { .. } => Stage::Verification,
            Error::Config(_) => Stage::Configuration,
            _ => Stage::Generation,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        let status = err.status().map(|s| s.as_u16());
        let transient = match status {
            Some(s) => (500..600).contains(&s),
            None => err.is_connect() || err.is_timeout() || err.is_body() || err.is_request(),
        };
        Error::Network {
            url,
            status,
            transient,
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Multimodal(format!("could not decode image: {err}"))
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Shared(err)
    }
}
