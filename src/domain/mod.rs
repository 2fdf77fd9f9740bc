//! Domain layer - Call and client lifecycles
//!
//! This layer contains:
//! - Value Objects: call and client states with their legal transitions
//! - Domain Events: notifications raised as calls and the client progress

pub mod call;
pub mod client;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
