/// STUN (Session Traversal Utilities for NAT) protocol implementation
/// RFC 5389
pub mod binding;
pub mod message;

pub use binding::{BindingOutcome, StunBinding};
pub use message::{StunAttribute, StunError, StunMessage, StunMessageType};
