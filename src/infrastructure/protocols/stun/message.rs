/// STUN message format (RFC 5389)
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// STUN errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("Message too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown message type: {0:#x}")]
    UnknownType(u16),

    #[error("Invalid magic cookie")]
    InvalidCookie,
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
}

impl StunMessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(StunMessageType::BindingRequest),
            0x0101 => Some(StunMessageType::BindingResponse),
            0x0111 => Some(StunMessageType::BindingErrorResponse),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingResponse => 0x0101,
            StunMessageType::BindingErrorResponse => 0x0111,
        }
    }
}

/// STUN attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttributeType {
    MappedAddress = 0x0001,
    ChangedAddress = 0x0005,
    ErrorCode = 0x0009,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    /// RFC 3489 CHANGED-ADDRESS, read but never acted upon
    ChangedAddress(SocketAddr),
    Software(String),
    ErrorCode(u16, String),
    Unknown(u16, Vec<u8>),
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Magic cookie for STUN (RFC 5389)
    pub const MAGIC_COOKIE: u32 = 0x2112A442;

    /// Create new STUN Binding Request
    pub fn new_binding_request() -> Self {
        Self {
            message_type: StunMessageType::BindingRequest,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Response reporting `mapped` as XOR-MAPPED-ADDRESS
    pub fn new_binding_response(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::BindingResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Cheap check for the fixed STUN header, used to demultiplex datagrams
    pub fn is_stun(data: &[u8]) -> bool {
        data.len() >= 20
            && data[0] & 0xC0 == 0
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == Self::MAGIC_COOKIE
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        // Message Type (2 bytes)
        buffer.extend_from_slice(&self.message_type.to_u16().to_be_bytes());

        // Message Length (2 bytes) - will update later
        let length_pos = buffer.len();
        buffer.extend_from_slice(&0u16.to_be_bytes());

        // Magic Cookie (4 bytes)
        buffer.extend_from_slice(&Self::MAGIC_COOKIE.to_be_bytes());

        // Transaction ID (12 bytes)
        buffer.extend_from_slice(&self.transaction_id);

        // Attributes
        let attributes_start = buffer.len();
        for attr in &self.attributes {
            self.write_attribute(&mut buffer, attr);
        }

        // Update message length
        let attributes_len = buffer.len() - attributes_start;
        buffer[length_pos..length_pos + 2].copy_from_slice(&(attributes_len as u16).to_be_bytes());

        buffer
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < 20 {
            return Err(StunError::TooShort(data.len()));
        }

        // Parse message type
        let message_type_raw = u16::from_be_bytes([data[0], data[1]]);
        let message_type = StunMessageType::from_u16(message_type_raw)
            .ok_or(StunError::UnknownType(message_type_raw))?;

        // Parse message length
        let message_length = u16::from_be_bytes([data[2], data[3]]) as usize;

        // Check magic cookie
        let magic_cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic_cookie != Self::MAGIC_COOKIE {
            return Err(StunError::InvalidCookie);
        }

        // Parse transaction ID
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        // Parse attributes
        let mut attributes = Vec::new();
        let mut offset = 20;

        while offset < 20 + message_length {
            if offset + 4 > data.len() {
                break;
            }

            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;

            offset += 4;

            if offset + attr_length > data.len() {
                break;
            }

            let attr_data = &data[offset..offset + attr_length];
            if let Some(attr) = Self::parse_attribute(attr_type, attr_data, &transaction_id) {
                attributes.push(attr);
            }

            // Attributes are padded to 4-byte boundary
            offset += attr_length;
            offset += (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    fn write_header(buffer: &mut Vec<u8>, attr_type: StunAttributeType, len: usize) {
        buffer.extend_from_slice(&(attr_type as u16).to_be_bytes());
        buffer.extend_from_slice(&(len as u16).to_be_bytes());
    }

    fn write_padding(buffer: &mut Vec<u8>, len: usize) {
        let padding = (4 - (len % 4)) % 4;
        buffer.extend_from_slice(&vec![0u8; padding]);
    }

    /// Encode an address value, XOR-ed with the cookie and transaction ID if `xor`
    fn write_address(&self, buffer: &mut Vec<u8>, addr: &SocketAddr, xor: bool) {
        let mut key = [0u8; 16];
        if xor {
            key[0..4].copy_from_slice(&Self::MAGIC_COOKIE.to_be_bytes());
            key[4..16].copy_from_slice(&self.transaction_id);
        }

        let (family, octets): (u8, Vec<u8>) = match addr.ip() {
            IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
            IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
        };
        let port = addr.port() ^ u16::from_be_bytes([key[0], key[1]]);

        buffer.push(0);
        buffer.push(family);
        buffer.extend_from_slice(&port.to_be_bytes());
        buffer.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    }

    /// Write attribute to buffer
    fn write_attribute(&self, buffer: &mut Vec<u8>, attr: &StunAttribute) {
        match attr {
            StunAttribute::MappedAddress(addr) => {
                Self::write_header(buffer, StunAttributeType::MappedAddress, address_len(addr));
                self.write_address(buffer, addr, false);
            }
            StunAttribute::XorMappedAddress(addr) => {
                Self::write_header(buffer, StunAttributeType::XorMappedAddress, address_len(addr));
                self.write_address(buffer, addr, true);
            }
            StunAttribute::ChangedAddress(addr) => {
                Self::write_header(buffer, StunAttributeType::ChangedAddress, address_len(addr));
                self.write_address(buffer, addr, false);
            }
            StunAttribute::Software(software) => {
                Self::write_header(buffer, StunAttributeType::Software, software.len());
                buffer.extend_from_slice(software.as_bytes());
                Self::write_padding(buffer, software.len());
            }
            StunAttribute::ErrorCode(code, reason) => {
                let len = 4 + reason.len();
                Self::write_header(buffer, StunAttributeType::ErrorCode, len);
                buffer.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
                buffer.extend_from_slice(reason.as_bytes());
                Self::write_padding(buffer, len);
            }
            StunAttribute::Unknown(attr_type, data) => {
                buffer.extend_from_slice(&attr_type.to_be_bytes());
                buffer.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buffer.extend_from_slice(data);
                Self::write_padding(buffer, data.len());
            }
        }
    }

    fn parse_address(data: &[u8], key: &[u8; 16]) -> Option<SocketAddr> {
        if data.len() < 8 {
            return None;
        }
        let family = data[1];
        let port = u16::from_be_bytes([data[2], data[3]]) ^ u16::from_be_bytes([key[0], key[1]]);

        match family {
            0x01 => {
                let mut octets = [0u8; 4];
                for i in 0..4 {
                    octets[i] = data[4 + i] ^ key[i];
                }
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            0x02 if data.len() >= 20 => {
                let mut octets = [0u8; 16];
                for i in 0..16 {
                    octets[i] = data[4 + i] ^ key[i];
                }
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    }

    /// Parse attribute from bytes
    fn parse_attribute(attr_type: u16, data: &[u8], transaction_id: &[u8; 12]) -> Option<StunAttribute> {
        let plain = [0u8; 16];
        match attr_type {
            0x0001 => Self::parse_address(data, &plain).map(StunAttribute::MappedAddress),
            0x0005 => Self::parse_address(data, &plain).map(StunAttribute::ChangedAddress),
            0x0020 => {
                // XOR with magic cookie + transaction ID
                let mut xor_key = [0u8; 16];
                xor_key[0..4].copy_from_slice(&Self::MAGIC_COOKIE.to_be_bytes());
                xor_key[4..16].copy_from_slice(transaction_id);
                Self::parse_address(data, &xor_key).map(StunAttribute::XorMappedAddress)
            }
            0x0009 if data.len() >= 4 => {
                let code = (data[2] & 0x07) as u16 * 100 + data[3] as u16;
                let reason = String::from_utf8_lossy(&data[4..]).to_string();
                Some(StunAttribute::ErrorCode(code, reason))
            }
            0x8022 => String::from_utf8(data.to_vec()).ok().map(StunAttribute::Software),
            _ => Some(StunAttribute::Unknown(attr_type, data.to_vec())),
        }
    }

    /// Add SOFTWARE attribute
    pub fn add_software(&mut self, software: String) {
        self.attributes.push(StunAttribute::Software(software));
    }

    /// Get XOR-MAPPED-ADDRESS attribute
    pub fn get_xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Get MAPPED-ADDRESS attribute
    pub fn get_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Reflexive address, XOR-MAPPED-ADDRESS preferred
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.get_xor_mapped_address().or_else(|| self.get_mapped_address())
    }

    /// Get CHANGED-ADDRESS attribute
    pub fn get_changed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ChangedAddress(addr) => Some(*addr),
            _ => None,
        })
    }
}

fn address_len(addr: &SocketAddr) -> usize {
    if addr.is_ipv4() {
        8
    } else {
        20
    }
}
