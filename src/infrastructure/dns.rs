//! SIP and STUN server discovery
//!
//! `_sip._udp.<domain>` and `_stun._udp.<domain>` SRV records are tried
//! first; without them the servers are assumed to be `sip.<domain>:5060`
//! and `stun.<domain>:3478`.

use async_trait::async_trait;
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use std::cmp::Reverse;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::debug;

pub const SIP_PORT: u16 = 5060;
pub const STUN_PORT: u16 = 3478;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("DNS lookup failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("No address found for {0}")]
    NoAddress(String),
}

/// Resolves the servers of a SIP domain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServerResolver: Send + Sync {
    /// Address of the domain's SIP registrar
    async fn resolve_sip(&self, domain: &str) -> Result<SocketAddr, DnsError>;

    /// Address of the domain's STUN server
    async fn resolve_stun(&self, domain: &str) -> Result<SocketAddr, DnsError>;
}

/// [`ServerResolver`] backed by the system DNS configuration
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// SRV lookup for `service`, falling back to `fallback_host:fallback_port`
    async fn resolve_service(
        &self,
        service: &str,
        fallback_host: &str,
        fallback_port: u16,
    ) -> Result<SocketAddr, DnsError> {
        match self.resolver.srv_lookup(service).await {
            Ok(srv) => {
                let mut records: Vec<_> = srv.iter().cloned().collect();
                records.sort_by_key(|r| (r.priority(), Reverse(r.weight())));
                for record in records {
                    let target = record.target().to_utf8();
                    match self.lookup_host(&target, record.port()).await {
                        Ok(addr) => return Ok(addr),
                        Err(e) => debug!("SRV target {} unusable: {}", target, e),
                    }
                }
            }
            Err(e) => debug!("No SRV record for {}: {}", service, e),
        }
        self.lookup_host(fallback_host, fallback_port).await
    }

    async fn lookup_host(&self, host: &str, port: u16) -> Result<SocketAddr, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let ips = self.resolver.lookup_ip(host).await?;
        ips.iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| ips.iter().next())
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| DnsError::NoAddress(host.to_string()))
    }
}

#[async_trait]
impl ServerResolver for DnsResolver {
    async fn resolve_sip(&self, domain: &str) -> Result<SocketAddr, DnsError> {
        self.resolve_service(&format!("_sip._udp.{}", domain), &format!("sip.{}", domain), SIP_PORT)
            .await
    }

    async fn resolve_stun(&self, domain: &str) -> Result<SocketAddr, DnsError> {
        self.resolve_service(&format!("_stun._udp.{}", domain), &format!("stun.{}", domain), STUN_PORT)
            .await
    }
}
