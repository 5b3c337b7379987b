use fleetflow_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Duplicate flow: {0}")]
    DuplicateFlow(String),

    #[error("Version conflict on {key}")]
    VersionConflict { key: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lease unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, OrchestratorError::VersionConflict { .. })
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(err: ModelError) -> Self {
        OrchestratorError::InvalidArgument(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
