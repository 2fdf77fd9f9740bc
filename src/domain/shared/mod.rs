//! Shared kernel - types used by both the call and the client contexts

pub mod error;
pub mod result;

pub use error::DomainError;
pub use result::Result;
