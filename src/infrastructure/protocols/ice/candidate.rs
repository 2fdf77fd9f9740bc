/// ICE candidate types and SDP `a=candidate` codec
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Component ID of the RTP flow
pub const RTP_COMPONENT: u16 = 1;
/// Component ID of the RTCP flow
pub const RTCP_COMPONENT: u16 = 2;

/// ICE candidate types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate - local interface address
    Host,
    /// Server reflexive candidate - public address discovered via STUN
    ServerReflexive,
    /// Peer reflexive candidate - discovered during connectivity checks
    PeerReflexive,
    /// Relay candidate - address on TURN relay server
    Relay,
}

impl CandidateType {
    pub fn priority_preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

/// ICE candidate (UDP only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Foundation - unique identifier for candidates from same source
    pub foundation: String,
    /// Component ID (1 = RTP, 2 = RTCP)
    pub component: u16,
    pub priority: u32,
    /// Connection address
    pub address: SocketAddr,
    pub candidate_type: CandidateType,
}

impl IceCandidate {
    /// Create a new ICE candidate
    pub fn new(candidate_type: CandidateType, address: SocketAddr, component: u16) -> Self {
        Self {
            foundation: Self::compute_foundation(candidate_type, address.ip()),
            component,
            priority: Self::compute_priority(candidate_type, component),
            address,
            candidate_type,
        }
    }

    /// Candidates of the same type from the same interface share a foundation
    fn compute_foundation(candidate_type: CandidateType, ip: IpAddr) -> String {
        let mut hasher = DefaultHasher::new();
        (candidate_type, ip).hash(&mut hasher);
        format!("{}", hasher.finish() % 100_000_000)
    }

    /// Compute priority according to RFC 5245
    /// priority = (2^24)*(type preference) + (2^8)*(local preference) + (256 - component ID)
    pub fn compute_priority(candidate_type: CandidateType, component: u16) -> u32 {
        let type_pref = candidate_type.priority_preference();
        let local_pref = 65535u32; // Maximum local preference
        let component_id = component as u32;

        (1 << 24) * type_pref + (1 << 8) * local_pref + (256 - component_id)
    }

    /// Convert to SDP candidate attribute value
    /// Example: "candidate:1 1 UDP 2130706431 192.168.1.100 5000 typ host"
    pub fn to_sdp(&self) -> String {
        format!(
            "candidate:{} {} UDP {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type.as_str()
        )
    }

    /// Parse an SDP candidate attribute value.
    ///
    /// Exactly eight tokens are expected with `typ` as the seventh;
    /// anything else yields `None`.
    pub fn from_sdp(sdp: &str) -> Option<Self> {
        let parts: Vec<&str> = sdp.split_whitespace().collect();
        if parts.len() != 8 || parts[6] != "typ" {
            return None;
        }

        // Remove "candidate:" prefix if present
        let foundation = parts[0].trim_start_matches("candidate:").to_string();
        let component = parts[1].parse::<u16>().ok()?;
        if !parts[2].eq_ignore_ascii_case("udp") {
            return None;
        }
        let priority = parts[3].parse::<u32>().ok()?;
        let ip = parts[4].parse::<IpAddr>().ok()?;
        let port = parts[5].parse::<u16>().ok()?;
        let candidate_type = CandidateType::from_string(parts[7])?;

        Some(Self {
            foundation,
            component,
            priority,
            address: SocketAddr::new(ip, port),
            candidate_type,
        })
    }
}
