//! Line-oriented SDP (Session Description Protocol) container
//!
//! Only the `<type>=<value>` framing is handled here. Interpreting the
//! fields (connection address, media line, ICE attributes, rtpmap) is the
//! job of the call that carries the description.

use std::fmt;

/// SDP session description as an ordered list of `(type, value)` fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMessage {
    fields: Vec<(char, String)>,
}

impl SdpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an SDP body.
    ///
    /// Lines are separated by `\n` with an optional trailing `\r`. Parsing
    /// stops at the first line that is not of the form `x=value`.
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut fields = Vec::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let mut chars = line.chars();
            match (chars.next(), chars.next()) {
                (Some(tag), Some('=')) => fields.push((tag, chars.as_str().to_string())),
                _ => break,
            }
        }

        Self { fields }
    }

    pub fn add_field(&mut self, tag: char, value: impl Into<String>) {
        self.fields.push((tag, value.into()));
    }

    pub fn fields(&self) -> &[(char, String)] {
        &self.fields
    }

    /// Values of every field with the given type
    pub fn field_values(&self, tag: char) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize as `x=value\r\n` lines, in insertion order
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SdpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (tag, value) in &self.fields {
            write!(f, "{}={}\r\n", tag, value)?;
        }
        Ok(())
    }
}
