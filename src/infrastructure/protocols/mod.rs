//! Network protocols: SIP signaling, STUN and ICE media connectivity

pub mod ice;
pub mod sip;
pub mod stun;
