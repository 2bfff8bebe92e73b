use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failed simulated API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatorErrorKind {
    UnknownApi,
    MissingRequiredParameter,
    InvalidParameterType,
    PreconditionViolation,
}

/// Error raised by the API simulator. Stored on the turn, never propagated.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct SimulatorError {
    pub kind: SimulatorErrorKind,
    pub message: String,
}

impl SimulatorError {
    pub fn new(kind: SimulatorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors from the completion endpoint
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transient; retried by `client::Retrying`
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("rate limited after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Invalid run configuration, detected before any conversation is processed
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_chained_calls must be at least 1")]
    ZeroChainBound,

    #[error("retry_attempts must be at least 1")]
    ZeroRetryAttempts,

    #[error("the function_call dialect needs the chat completion style")]
    StructuredCallsNeedChat,

    #[error("environment variable {0} not found")]
    MissingApiKey(String),
}

/// Structural invariant broken by the harness itself
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("turn {turn}: api prediction {prediction} is missing `{field}`")]
    UnscoredPrediction {
        turn: usize,
        prediction: usize,
        field: &'static str,
    },

    #[error("turn {turn}: ground-truth api turn has no predictions")]
    NoPredictions { turn: usize },

    #[error("turn {turn}: ground-truth api turn is missing `{field}`")]
    UnscoredTurn { turn: usize, field: &'static str },

    #[error("conversation has no metrics")]
    MissingMetrics,
}
