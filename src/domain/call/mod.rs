//! Call bounded context - lifecycle states and notifications of a call

pub mod event;
pub mod value_object;

pub use event::CallEvent;
pub use value_object::{CallDirection, CallState};
