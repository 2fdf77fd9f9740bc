//! Call value objects

use crate::domain::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Call received from a remote party
    Incoming,
    /// Call placed by the local user
    Outgoing,
}

/// Call state
///
/// ```text
/// Offer -> Connecting -> Active -> Disconnecting -> Finished
///   |          |                                      ^
///   +----------+--------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Incoming call awaiting accept, or outgoing call not yet INVITEd
    Offer,
    /// INVITE sent (outgoing) or 200 OK sent (incoming)
    Connecting,
    /// Media is flowing
    Active,
    /// BYE sent, awaiting its response
    Disconnecting,
    /// Terminal state
    Finished,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            (Offer, Connecting) => true,
            (Offer, Disconnecting) => true,
            (Offer, Finished) => true,

            (Connecting, Active) => true,
            (Connecting, Disconnecting) => true,
            (Connecting, Finished) => true,

            (Active, Disconnecting) => true,
            (Active, Finished) => true,

            (Disconnecting, Finished) => true,

            (Finished, _) => false,

            _ => false,
        }
    }

    pub fn validate_transition(&self, new_state: CallState) -> Result<()> {
        if self.can_transition_to(&new_state) {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition(format!(
                "{} -> {}",
                self.name(),
                new_state.name()
            )))
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CallState::Finished)
    }

    /// Get state name for logging
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Offer => "offer",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Disconnecting => "disconnecting",
            CallState::Finished => "finished",
        }
    }
}
