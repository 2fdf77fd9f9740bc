//! RTP payload type descriptions, as carried in SDP `m=` / `a=rtpmap`

use super::g711::{AudioCodec, G711Type};

/// First dynamic payload type id
pub const DYNAMIC_PAYLOAD_BASE: u8 = 96;

/// Id we offer telephone-event under
pub const TELEPHONE_EVENT_ID: u8 = 101;

const DEFAULT_PTIME: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clockrate: u32,
    pub channels: u8,
    /// Packetization time in milliseconds
    pub ptime: u32,
}

impl PayloadType {
    pub fn new(id: u8, name: &str, clockrate: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            clockrate,
            channels: 1,
            ptime: DEFAULT_PTIME,
        }
    }

    pub fn pcmu() -> Self {
        Self::new(G711Type::PCMU.payload_type(), G711Type::PCMU.name(), 8000)
    }

    pub fn pcma() -> Self {
        Self::new(G711Type::PCMA.payload_type(), G711Type::PCMA.name(), 8000)
    }

    /// RFC 4733 named telephone events
    pub fn telephone_event() -> Self {
        Self::new(TELEPHONE_EVENT_ID, "telephone-event", 8000)
    }

    /// Description for an id listed in an `m=` line; static audio ids get
    /// their RFC 3551 encoding, others stay unnamed until an rtpmap arrives
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Self::pcmu(),
            8 => Self::pcma(),
            _ => Self::new(id, "", 0),
        }
    }

    /// Apply an `a=rtpmap` value: `<id> <name>/<clockrate>[/<channels>]`.
    ///
    /// Returns `false` if the value is malformed or for another id.
    pub fn apply_rtpmap(&mut self, value: &str) -> bool {
        let Some((id, encoding)) = value.trim().split_once(' ') else {
            return false;
        };
        if id.parse::<u8>().ok() != Some(self.id) {
            return false;
        }

        let mut parts = encoding.trim().split('/');
        let name = parts.next().unwrap_or_default();
        let Some(clockrate) = parts.next().and_then(|c| c.parse().ok()) else {
            return false;
        };
        let channels = match parts.next() {
            Some(c) => match c.parse() {
                Ok(channels) => channels,
                Err(_) => return false,
            },
            None => 1,
        };

        self.name = name.to_string();
        self.clockrate = clockrate;
        self.channels = channels;
        true
    }

    /// `a=rtpmap` value for this payload type
    pub fn rtpmap(&self) -> String {
        if self.channels > 1 {
            format!("{} {}/{}/{}", self.id, self.name, self.clockrate, self.channels)
        } else {
            format!("{} {}/{}", self.id, self.name, self.clockrate)
        }
    }

    pub fn is_telephone_event(&self) -> bool {
        self.name.eq_ignore_ascii_case("telephone-event")
    }

    /// Static ids match by id, dynamic ones by encoding
    pub fn matches(&self, other: &PayloadType) -> bool {
        if self.id < DYNAMIC_PAYLOAD_BASE || other.id < DYNAMIC_PAYLOAD_BASE {
            self.id == other.id
        } else {
            self.name.eq_ignore_ascii_case(&other.name)
                && self.clockrate == other.clockrate
                && self.channels == other.channels
        }
    }

    /// Samples (all channels) in one packet
    pub fn frame_samples(&self) -> usize {
        (self.clockrate as usize * self.channels as usize * self.ptime as usize) / 1000
    }

    /// Bytes of 16-bit PCM in one packet
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }

    pub fn codec(&self) -> Option<Box<dyn AudioCodec>> {
        if self.clockrate != 8000 || self.channels != 1 {
            return None;
        }
        G711Type::from_name(&self.name).map(|g711| g711.codec())
    }
}
