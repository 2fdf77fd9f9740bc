//! G.711 Audio Codec Implementation
//!
//! G.711 provides toll-quality narrowband audio at 64 kbit/s with two
//! companding laws:
//! - μ-law (PCMU): Used primarily in North America and Japan
//! - A-law (PCMA): Used in Europe and rest of the world
//!
//! Codecs work on 16-bit signed little-endian PCM, the format exchanged
//! with the audio devices.

use bytes::{BufMut, Bytes, BytesMut};

/// Speech codec used by the RTP channel
pub trait AudioCodec: Send {
    /// Encode little-endian 16-bit PCM into an RTP payload
    fn encode(&self, pcm: &[u8]) -> Bytes;

    /// Decode an RTP payload into little-endian 16-bit PCM
    fn decode(&self, payload: &[u8]) -> Vec<u8>;
}

fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(2).map(|s| i16::from_le_bytes([s[0], s[1]]))
}

/// G.711 Codec Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Type {
    /// μ-law (PCMU) - Payload Type 0
    PCMU,
    /// A-law (PCMA) - Payload Type 8
    PCMA,
}

impl G711Type {
    /// Get RTP payload type
    pub fn payload_type(&self) -> u8 {
        match self {
            G711Type::PCMU => 0,
            G711Type::PCMA => 8,
        }
    }

    /// Get codec name
    pub fn name(&self) -> &'static str {
        match self {
            G711Type::PCMU => "PCMU",
            G711Type::PCMA => "PCMA",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("PCMU") {
            Some(G711Type::PCMU)
        } else if name.eq_ignore_ascii_case("PCMA") {
            Some(G711Type::PCMA)
        } else {
            None
        }
    }

    pub fn codec(&self) -> Box<dyn AudioCodec> {
        match self {
            G711Type::PCMU => Box::new(PcmuCodec),
            G711Type::PCMA => Box::new(PcmaCodec),
        }
    }
}

/// G.711 μ-law (PCMU) Codec
pub struct PcmuCodec;

impl PcmuCodec {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    pub fn encode_sample(sample: i16) -> u8 {
        let sample = sample as i32;
        let sign = if sample < 0 { 0x80 } else { 0x00 };
        let magnitude = sample.abs().min(Self::CLIP) + Self::BIAS;

        // position of the highest set bit above bit 7
        let exponent = (0..8).rev().find(|e| magnitude & (0x80 << e) != 0).unwrap_or(0);
        let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

        !(sign | (exponent << 4) | mantissa) as u8
    }

    pub fn decode_sample(ulaw: u8) -> i16 {
        let ulaw = !ulaw as i32;
        let exponent = (ulaw & 0x70) >> 4;
        let magnitude = (((ulaw & 0x0F) << 3) + Self::BIAS) << exponent;

        if ulaw & 0x80 != 0 {
            (Self::BIAS - magnitude) as i16
        } else {
            (magnitude - Self::BIAS) as i16
        }
    }
}

impl AudioCodec for PcmuCodec {
    fn encode(&self, pcm: &[u8]) -> Bytes {
        samples(pcm).map(Self::encode_sample).collect::<Vec<_>>().into()
    }

    fn decode(&self, payload: &[u8]) -> Vec<u8> {
        let mut output = BytesMut::with_capacity(payload.len() * 2);
        for &byte in payload {
            output.put_i16_le(Self::decode_sample(byte));
        }
        output.to_vec()
    }
}

/// G.711 A-law (PCMA) Codec
pub struct PcmaCodec;

impl PcmaCodec {
    /// Upper bound of each A-law segment, on 13-bit magnitudes
    const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

    pub fn encode_sample(sample: i16) -> u8 {
        let mut pcm = (sample as i32) >> 3;
        let mask = if pcm >= 0 {
            0xD5
        } else {
            pcm = -pcm - 1;
            0x55
        };

        let segment = Self::SEG_AEND.iter().position(|&end| pcm <= end);
        let aval = match segment {
            None => 0x7F,
            Some(seg) => {
                let shift = if seg < 2 { 1 } else { seg };
                ((seg as i32) << 4) | ((pcm >> shift) & 0x0F)
            }
        };

        (aval ^ mask) as u8
    }

    pub fn decode_sample(alaw: u8) -> i16 {
        let alaw = (alaw ^ 0x55) as i32;
        let segment = (alaw & 0x70) >> 4;
        let mut magnitude = (alaw & 0x0F) << 4;

        match segment {
            0 => magnitude += 8,
            1 => magnitude += 0x108,
            _ => magnitude = (magnitude + 0x108) << (segment - 1),
        }

        if alaw & 0x80 != 0 {
            magnitude as i16
        } else {
            -magnitude as i16
        }
    }
}

impl AudioCodec for PcmaCodec {
    fn encode(&self, pcm: &[u8]) -> Bytes {
        samples(pcm).map(Self::encode_sample).collect::<Vec<_>>().into()
    }

    fn decode(&self, payload: &[u8]) -> Vec<u8> {
        let mut output = BytesMut::with_capacity(payload.len() * 2);
        for &byte in payload {
            output.put_i16_le(Self::decode_sample(byte));
        }
        output.to_vec()
    }
}
