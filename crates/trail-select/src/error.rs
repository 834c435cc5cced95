//! Error Types for the ensemble pipeline

use thiserror::Error;
use trail_core::AgentError;

use crate::candidate::CandidateId;

pub type Result<T> = std::result::Result<T, SelectError>;

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Duplicate candidate id {0}")]
    DuplicateCandidate(CandidateId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Selection cancelled")]
    Cancelled,

    #[error("Trial environment error: {0}")]
    Environment(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
