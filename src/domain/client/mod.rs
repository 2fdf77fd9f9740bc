//! Client bounded context - registration lifecycle and client notifications

pub mod event;
pub mod value_object;

pub use event::ClientEvent;
pub use value_object::ClientState;
