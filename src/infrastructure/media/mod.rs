//! Media processing implementations

pub mod audio;
pub mod codec;
pub mod rtp;

pub use audio::{AudioDevices, AudioFormat, AudioInput, AudioOutput, AudioPipeline, NullAudioDevices};
pub use codec::{AudioCodec, G711Type, PayloadType, PcmaCodec, PcmuCodec};
pub use rtp::{key_tone, ChannelConfig, RtpAudioChannel, RtpError, RtpPacket, MAX_TONE};
