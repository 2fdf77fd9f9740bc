//! Client events

use crate::domain::call::CallEvent;
use crate::domain::client::value_object::ClientState;
use serde::{Deserialize, Serialize};

/// Notification emitted by the user agent, drained with `SipClient::poll_event`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Registration state changed
    StateChanged(ClientState),
    /// Registration succeeded
    Connected,
    /// Registration ended or failed
    Disconnected,
    /// A new incoming call is waiting to be accepted
    CallReceived { call_id: String, from: String },
    /// An outgoing call was placed or an incoming call was accepted
    CallStarted { call_id: String },
    /// The number of calls owned by the client changed
    ActiveCallsChanged(usize),
    /// Notification from one of the calls
    Call { call_id: String, event: CallEvent },
}

impl ClientEvent {
    /// Call the event refers to, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ClientEvent::CallReceived { call_id, .. }
            | ClientEvent::CallStarted { call_id }
            | ClientEvent::Call { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}
