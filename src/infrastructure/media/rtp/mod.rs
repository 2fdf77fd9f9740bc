//! RTP (Real-time Transport Protocol) Implementation
//!
//! Packet codec per RFC 3550 and the audio channel built on top of it.

pub mod channel;
pub mod packet;

pub use channel::{key_tone, ChannelConfig, RtpAudioChannel, MAX_TONE};
pub use packet::{RtpError, RtpPacket};
