//! SIP user agent
//!
//! A client-side SIP stack (RFC 3261) over UDP: registration, calls and
//! their SDP offer/answer.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │       SipClient         │
//! │ (registration/dispatch) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │        SipCall          │
//! │  (dialog + SDP + media) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Transaction Layer    │
//! │ (non-INVITE client TXN) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  SipMessage / builder   │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call;
pub mod client;
pub mod context;
pub mod message;
pub mod sdp;
pub mod transaction;

pub use auth::{AuthChallenge, UserCredentials};
pub use builder::UserAgent;
pub use call::{CallSettings, SipCall};
pub use client::{ClientAction, SipClient};
pub use context::SipCallContext;
pub use message::{sip_address_to_uri, SipError, SipMessage, SipMethod};
pub use sdp::SdpMessage;
pub use transaction::{SipTimers, SipTransaction, TransactionState};
