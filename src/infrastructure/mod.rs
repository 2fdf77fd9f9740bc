//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP, STUN, ICE)
//! - RTP media and audio device seams
//! - Server discovery over DNS

pub mod dns;
pub mod media;
pub mod protocols;
