/// ICE (Interactive Connectivity Establishment) candidate gathering
/// RFC 5245
pub mod candidate;
pub mod connection;

pub use candidate::{CandidateType, IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};
pub use connection::IceConnection;
