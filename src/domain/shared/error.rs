//! Domain errors

use thiserror::Error;

/// Violation of a lifecycle rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}
