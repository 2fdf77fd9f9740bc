//! yakphone - A SIP softphone engine built with Rust
//!
//! Registers with a SIP server over UDP, places and answers calls, and
//! carries their G.711 audio over RTP with STUN and ICE connectivity
//! checks.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Phone, PhoneError, PhoneHandle};
pub use config::PhoneConfig;
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
