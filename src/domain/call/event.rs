//! Call events
//!
//! Recorded by a call while it handles a message or a timer and drained by
//! its owner once the call has returned.

use crate::domain::call::value_object::CallState;
use serde::{Deserialize, Serialize};

/// Notification emitted by a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// The call moved to a new state
    StateChanged(CallState),
    /// The remote party is being alerted (180 received)
    Ringing,
    /// The call entered the active state, media pipelines are running
    Connected,
    /// The call reached its terminal state
    Finished,
}
