use std::fmt;

use thiserror::Error;

use crate::ids::PolicyId;

/// Why a destructive operation on a target was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// One or more policies install this target automatically on failure.
    PolicyAutomation { policies: Vec<PolicyId> },
    /// The target is installed while new hosts run the setup experience.
    SetupExperience,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyAutomation { .. } => f.write_str(
                "Couldn't delete. Policy automation uses this software. \
                 Please disable policy automation for this software and try again.",
            ),
            Self::SetupExperience => f.write_str(
                "Couldn't delete. This software is installed when new hosts enroll. \
                 Please remove it from the setup experience and try again.",
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Conflict(ConflictReason),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Retryable backend failure: lock contention, busy database, lost connection.
    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
