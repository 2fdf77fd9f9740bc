//! Application layer - Runs the softphone
//!
//! The protocol core in `infrastructure` never touches a socket or a
//! clock. This layer owns both: it binds the UDP sockets, resolves the
//! servers and feeds datagrams, commands and timer deadlines to the
//! [`SipClient`](crate::infrastructure::protocols::sip::SipClient).

pub mod error;
pub mod phone;

pub use error::{PhoneError, Result};
pub use phone::{Phone, PhoneCommand, PhoneHandle};
