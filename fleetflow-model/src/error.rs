use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidId { kind: &'static str, value: String },
    InvalidTransition { from: String, to: String },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidId { kind, value } => {
                write!(f, "invalid {kind} id: {value:?}")
            }
            ModelError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
