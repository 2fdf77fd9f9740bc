//! SIP message codec
//!
//! A deliberately lenient parser: anything that does not look like a SIP
//! request or response is returned as an empty message for which both
//! [`SipMessage::is_request`] and [`SipMessage::is_reply`] are false.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// SIP errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not connected to server")]
    NotConnected,

    #[error("Unknown call: {0}")]
    UnknownCall(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Media error: {0}")]
    Media(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP methods understood by the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "CANCEL" => Ok(SipMethod::Cancel),
            "BYE" => Ok(SipMethod::Bye),
            "OPTIONS" => Ok(SipMethod::Options),
            other => Err(SipError::ParseError(format!("Unknown method: {}", other))),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const SIP_VERSION: &str = "SIP/2.0";

/// Compact header forms (RFC 3261 Section 7.3.3)
const COMPACT_FORMS: [(&str, &str); 8] = [
    ("c", "Content-Type"),
    ("f", "From"),
    ("i", "Call-ID"),
    ("k", "Supported"),
    ("l", "Content-Length"),
    ("m", "Contact"),
    ("t", "To"),
    ("v", "Via"),
];

fn expand_header_name(name: &str) -> String {
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| short.eq_ignore_ascii_case(name))
        .map(|(_, long)| long.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Split `value` on `separator`, ignoring separators inside quotes or `<...>`.
pub(crate) fn split_unquoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut bracketed = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => bracketed = true,
            '>' if !quoted => bracketed = false,
            c if c == separator && !quoted && !bracketed => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Extract the URI from a name-addr such as `"Bob" <sip:bob@example.com>;tag=1`.
///
/// Returns `None` if no `<sip:...>` part is present or the URI is invalid.
pub fn sip_address_to_uri(address: &str) -> Option<String> {
    let start = address.find('<')?;
    let end = start + address[start..].find('>')?;
    let uri = address[start + 1..end].trim();
    if !uri.starts_with("sip:") {
        return None;
    }
    rsip::Uri::try_from(uri).ok()?;
    Some(uri.to_string())
}

/// A SIP request or response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipMessage {
    method: String,
    uri: String,
    status_code: u16,
    reason_phrase: String,
    fields: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SipMessage {
    /// Create a request with the given method and request-URI
    pub fn new_request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method: method.as_str().to_string(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Create a response with the given status code and reason phrase
    pub fn new_response(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            ..Default::default()
        }
    }

    /// Parse a SIP message from wire bytes
    pub fn parse(data: &[u8]) -> Self {
        let mut message = Self::default();

        let head_end = match find_crlf(data, 0) {
            Some(pos) => pos,
            None => return message,
        };
        let start_line = String::from_utf8_lossy(&data[..head_end]);

        if start_line.starts_with("SIP/2.0 ") && start_line.len() >= 10 {
            let code = start_line.get(8..11).and_then(|c| c.parse::<u16>().ok());
            match code {
                Some(code) => {
                    message.status_code = code;
                    message.reason_phrase =
                        start_line.get(12..).unwrap_or_default().trim().to_string();
                }
                None => return Self::default(),
            }
        } else if start_line.ends_with(" SIP/2.0") && start_line.len() > 10 {
            let request = &start_line[..start_line.len() - SIP_VERSION.len() - 1];
            match request.split_once(' ') {
                Some((method, uri)) if !method.is_empty() && !uri.trim().is_empty() => {
                    message.method = method.to_string();
                    message.uri = uri.trim().to_string();
                }
                _ => return Self::default(),
            }
        } else {
            return Self::default();
        }

        let mut pos = head_end + 2;
        loop {
            let line_end = match find_crlf(data, pos) {
                Some(end) => end,
                // unterminated header section
                None => return Self::default(),
            };
            if line_end == pos {
                message.body = data[pos + 2..].to_vec();
                break;
            }

            let line = String::from_utf8_lossy(&data[pos..line_end]);
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous header
                if let Some((_, value)) = message.fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some((name, value)) = line.split_once(':') {
                message
                    .fields
                    .push((expand_header_name(name.trim()), value.trim().to_string()));
            }
            pos = line_end + 2;
        }

        message
    }

    /// Serialize the message for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();

        if self.is_reply() {
            out.push_str(&format!(
                "{} {} {}\r\n",
                SIP_VERSION, self.status_code, self.reason_phrase
            ));
        } else if self.is_request() {
            out.push_str(&format!("{} {} {}\r\n", self.method, self.uri, SIP_VERSION));
        }

        for (name, value) in &self.fields {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.has_header_field("Content-Length") {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn is_request(&self) -> bool {
        !self.method.is_empty() && !self.uri.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        self.status_code != 0
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// All header fields in insertion order
    pub fn header_fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn has_header_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Values of every copy of a header, split on commas
    pub fn header_field_values(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| split_unquoted(value, ','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Values of every copy of a header, joined with ", "
    pub fn header_field(&self, name: &str) -> String {
        self.header_field_values(name).join(", ")
    }

    /// Replace every copy of a header with a single value
    pub fn set_header_field(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header_field(name);
        self.fields.push((name.to_string(), value.into()));
    }

    /// Append a header, keeping existing copies
    pub fn add_header_field(&mut self, name: &str, value: impl Into<String>) {
        self.fields.push((name.to_string(), value.into()));
    }

    pub fn remove_header_field(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// CSeq number
    pub fn sequence_number(&self) -> u32 {
        self.header_field("CSeq")
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    /// CSeq method
    pub fn sequence_method(&self) -> String {
        self.header_field("CSeq")
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string()
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        let via = self.header_field_values("Via").into_iter().next()?;
        Self::value_parameters(&via).remove("branch")
    }

    /// Parse the `;key=value` parameters that follow a header value
    pub fn value_parameters(value: &str) -> HashMap<String, String> {
        split_unquoted(value, ';')
            .into_iter()
            .skip(1)
            .filter_map(|param| {
                let param = param.trim();
                if param.is_empty() {
                    return None;
                }
                let (key, value) = param.split_once('=').unwrap_or((param, ""));
                Some((
                    key.trim().to_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}
