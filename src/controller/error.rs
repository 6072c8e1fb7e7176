//! Error types for the PostgresCluster controller

use std::time::Duration;

use thiserror::Error;

use crate::controller::pipeline::Stage;

/// Error variants are named with the `Error` suffix where they wrap another
/// library's error (e.g., `KubeError`, `YamlError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{kind} {name} is already controlled by {controller}")]
    AlreadyOwned {
        kind: String,
        name: String,
        controller: String,
    },

    #[error("Stage output not available: {0}")]
    MissingOutput(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("Deletion failed: {0}")]
    Deletion(#[source] Box<Error>),

    #[error("Reconcile cancelled")]
    Cancelled,

    #[error("Reconcile exceeded its deadline of {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Wrap this error with the stage that produced it
    pub fn in_stage(self, stage: Stage) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through stage and deletion wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Deletion(source) => source.root(),
            other => other,
        }
    }

    /// Stage that produced this error, if it came from the pipeline
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            Error::Deletion(source) => source.stage(),
            _ => None,
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self.root() {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_)) || self.api_code() == Some(404)
    }

    /// Check if this error is an optimistic concurrency or ownership conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict(_) | Error::AlreadyOwned { .. })
            || self.api_code() == Some(409)
    }

    /// Check if the platform refused the operation
    pub fn is_forbidden(&self) -> bool {
        matches!(self.root(), Error::Forbidden(_)) || self.api_code() == Some(403)
    }

    /// Check if the deletion path produced this error
    pub fn is_deletion(&self) -> bool {
        matches!(self, Error::Deletion(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                // Network and other errors are retryable
                _ => true,
            },
            Error::Conflict(_) | Error::Timeout(_) | Error::Cancelled => true,
            // Resource might appear later
            Error::NotFound(_) | Error::MissingOutput(_) => true,
            Error::Forbidden(_) | Error::AlreadyOwned { .. } => false,
            Error::InvalidConfig(_) => false,
            Error::SerializationError(_) | Error::YamlError(_) | Error::Certificate(_) => false,
            Error::Stage { .. } | Error::Deletion(_) => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error. Conflicts and deletion failures retry
    /// immediately; everything else backs off.
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_deletion() || error.is_conflict() {
            Duration::ZERO
        } else if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Leave room for manual intervention
            self.max_delay
        }
    }
}
