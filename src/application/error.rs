//! Crate-wide error type

use crate::domain::DomainError;
use crate::infrastructure::dns::DnsError;
use crate::infrastructure::media::RtpError;
use crate::infrastructure::protocols::sip::SipError;
use crate::infrastructure::protocols::stun::StunError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhoneError {
    #[error(transparent)]
    Sip(#[from] SipError),

    #[error(transparent)]
    Rtp(#[from] RtpError),

    #[error(transparent)]
    Stun(#[from] StunError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Phone driver has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, PhoneError>;
