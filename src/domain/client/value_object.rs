//! Client value objects

use serde::{Deserialize, Serialize};

/// Registration state of the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Disconnected,
    /// REGISTER sent, awaiting a final response
    Connecting,
    /// Registered with the server
    Connected,
    /// Un-REGISTER (expires=0) sent
    Disconnecting,
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Disconnecting => "disconnecting",
        }
    }
}
