//! Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// How a failure is treated by the step engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable backend or network fault
    Transient,
    /// Non-retryable backend or protocol fault; ends the run
    Fatal,
    /// A tool ran and reported failure; surfaced to the model
    ToolFailure,
    /// Retry attempts or step count used up; ends the run
    BudgetExhausted,
    /// Unknown tool or malformed arguments; surfaced to the model
    ProtocolViolation,
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Provider rejected the request (invalid model, bad request)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable, overloaded, or the connection failed
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Response could not be decoded into a message
    #[error("Parse error: {0}")]
    Parse(String),

    /// An operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Retry budget used up; carries the last failure observed
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<AgentError>,
    },

    /// Tool not found in registry
    #[error("Unrecognized tool '{0}'")]
    ToolNotFound(String),

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Trajectory could not be written or read
    #[error("Trajectory error: {0}")]
    Trajectory(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Map the error onto the engine's failure taxonomy
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ProviderUnavailable(_) | Self::RateLimited(_) | Self::Timeout(_) => {
                ErrorClass::Transient
            }
            Self::RetryExhausted { .. } => ErrorClass::BudgetExhausted,
            Self::ToolNotFound(_) | Self::ToolValidation(_) => ErrorClass::ProtocolViolation,
            Self::ToolExecution(_) => ErrorClass::ToolFailure,
            Self::Provider(_)
            | Self::Auth(_)
            | Self::Parse(_)
            | Self::Trajectory(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorClass::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error ends the enclosing run
    pub fn is_terminal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal | ErrorClass::BudgetExhausted)
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
