/// Per-call ICE connection
///
/// Gathers host and server reflexive candidates for the RTP and RTCP
/// components and routes media datagrams to the best remote candidate.
/// Connectivity checks are not performed: the highest priority remote
/// candidate of a component is used as the send target.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::candidate::{CandidateType, IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};
use crate::infrastructure::protocols::sip::context::random_token;
use crate::infrastructure::protocols::stun::{BindingOutcome, StunBinding, StunMessage};

#[derive(Debug)]
struct IceComponent {
    id: u16,
    bound: Option<SocketAddr>,
    binding: StunBinding,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
}

impl IceComponent {
    fn has_reflexive(&self) -> bool {
        self.local_candidates
            .iter()
            .any(|c| c.candidate_type == CandidateType::ServerReflexive)
    }
}

#[derive(Debug)]
pub struct IceConnection {
    components: Vec<IceComponent>,
    stun_server: Option<SocketAddr>,
    local_user: String,
    local_password: String,
    remote_user: String,
    remote_password: String,
    outbox: VecDeque<(u16, SocketAddr, Vec<u8>)>,
    closed: bool,
}

impl IceConnection {
    pub fn new(
        stun_server: Option<SocketAddr>,
        retry_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let components = [RTP_COMPONENT, RTCP_COMPONENT]
            .into_iter()
            .map(|id| IceComponent {
                id,
                bound: None,
                binding: StunBinding::new(retry_interval, refresh_interval),
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
            })
            .collect();

        Self {
            components,
            stun_server,
            local_user: random_token(4),
            local_password: random_token(22),
            remote_user: String::new(),
            remote_password: String::new(),
            outbox: VecDeque::new(),
            closed: false,
        }
    }

    fn component(&self, id: u16) -> Option<&IceComponent> {
        self.components.iter().find(|c| c.id == id)
    }

    fn component_mut(&mut self, id: u16) -> Option<&mut IceComponent> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn local_password(&self) -> &str {
        &self.local_password
    }

    pub fn remote_user(&self) -> &str {
        &self.remote_user
    }

    pub fn set_remote_user(&mut self, user: impl Into<String>) {
        self.remote_user = user.into();
    }

    pub fn remote_password(&self) -> &str {
        &self.remote_password
    }

    pub fn set_remote_password(&mut self, password: impl Into<String>) {
        self.remote_password = password.into();
    }

    /// Local candidates of every component, RTP first
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.components
            .iter()
            .flat_map(|c| c.local_candidates.iter().cloned())
            .collect()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.components
            .iter()
            .flat_map(|c| c.remote_candidates.iter().cloned())
            .collect()
    }

    /// Add a remote candidate; candidates for unknown components are ignored
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if let Some(component) = self.component_mut(candidate.component) {
            if !component.remote_candidates.contains(&candidate) {
                component.remote_candidates.push(candidate);
            }
        }
    }

    /// Record the media socket of a component and start gathering on it
    pub fn media_bound(&mut self, component: u16, addr: SocketAddr, now: Instant) {
        let stun_server = self.stun_server;
        let Some(comp) = self.component_mut(component) else {
            return;
        };
        comp.bound = Some(addr);
        comp.local_candidates
            .push(IceCandidate::new(CandidateType::Host, addr, component));
        if let Some(server) = stun_server {
            comp.binding.set_server(server, now);
        }
    }

    /// Every component has its host candidate and, when a STUN server is
    /// configured, a server reflexive one
    pub fn is_gathering_complete(&self) -> bool {
        self.components.iter().all(|c| {
            c.bound.is_some() && (self.stun_server.is_none() || c.has_reflexive())
        })
    }

    /// Candidate advertised in the `c=` and `m=` lines for a component
    pub fn default_candidate(&self, component: u16) -> Option<&IceCandidate> {
        let comp = self.component(component)?;
        comp.local_candidates
            .iter()
            .find(|c| c.candidate_type == CandidateType::ServerReflexive)
            .or_else(|| comp.local_candidates.first())
    }

    /// Highest priority remote candidate of a component
    pub fn remote_target(&self, component: u16) -> Option<SocketAddr> {
        self.component(component)?
            .remote_candidates
            .iter()
            // ties go to the most recently added candidate
            .max_by_key(|c| c.priority)
            .map(|c| c.address)
    }

    /// Feed a datagram received on a component's socket.
    ///
    /// Returns `true` if it was a STUN message and must not be treated as
    /// media.
    pub fn handle_datagram(&mut self, component: u16, data: &[u8], now: Instant) -> bool {
        if !StunMessage::is_stun(data) {
            return false;
        }
        let Some(comp) = self.component_mut(component) else {
            return true;
        };
        if let BindingOutcome::Changed(addr) = comp.binding.handle_datagram(data, now) {
            comp.local_candidates
                .retain(|c| c.candidate_type != CandidateType::ServerReflexive);
            comp.local_candidates
                .push(IceCandidate::new(CandidateType::ServerReflexive, addr, component));
            debug!("ICE component {} gathered reflexive candidate {}", component, addr);
        }
        true
    }

    /// Queue a media datagram for the component's remote target
    pub fn send_datagram(&mut self, component: u16, data: Vec<u8>) -> bool {
        if self.closed {
            return false;
        }
        match self.remote_target(component) {
            Some(target) => {
                self.outbox.push_back((component, target, data));
                true
            }
            None => false,
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.components
            .iter()
            .filter_map(|c| c.binding.poll_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for comp in self.components.iter_mut() {
            comp.binding.handle_timeout(now);
        }
    }

    /// Next `(component, destination, datagram)` to send
    pub fn poll_transmit(&mut self) -> Option<(u16, SocketAddr, Vec<u8>)> {
        for comp in self.components.iter_mut() {
            if let Some((dest, data)) = comp.binding.poll_transmit() {
                return Some((comp.id, dest, data));
            }
        }
        self.outbox.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop gathering and drop pending media
    pub fn close(&mut self) {
        self.closed = true;
        self.outbox.clear();
        for comp in self.components.iter_mut() {
            comp.binding.stop();
        }
    }
}
