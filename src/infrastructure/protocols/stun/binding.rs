/// STUN binding discovery without I/O
///
/// One outstanding Binding request is retried until a matching response
/// arrives; the reflexive address is then cached and the binding is
/// refreshed periodically to keep the NAT mapping alive.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::message::{StunMessage, StunMessageType};

/// Result of feeding a datagram to a [`StunBinding`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOutcome {
    /// Not a response to our outstanding request
    Ignored,
    /// Matching response, reflexive address unchanged
    Refreshed,
    /// Matching response reporting a new reflexive address
    Changed(SocketAddr),
}

#[derive(Debug)]
pub struct StunBinding {
    server: Option<SocketAddr>,
    request: Option<StunMessage>,
    reflexive: Option<SocketAddr>,
    retry_interval: Duration,
    refresh_interval: Duration,
    next_send: Option<Instant>,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl StunBinding {
    pub fn new(retry_interval: Duration, refresh_interval: Duration) -> Self {
        Self {
            server: None,
            request: None,
            reflexive: None,
            retry_interval,
            refresh_interval,
            next_send: None,
            outbox: VecDeque::new(),
        }
    }

    /// Point the binding at a STUN server and send a request right away
    pub fn set_server(&mut self, server: SocketAddr, now: Instant) {
        debug!("Using STUN server {}", server);
        self.server = Some(server);
        self.request = None;
        self.send_request(now);
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Last discovered reflexive address
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.reflexive
    }

    /// Stop retries and refreshes
    pub fn stop(&mut self) {
        self.request = None;
        self.next_send = None;
        self.outbox.clear();
    }

    fn send_request(&mut self, now: Instant) {
        let Some(server) = self.server else {
            return;
        };
        let request = self
            .request
            .get_or_insert_with(StunMessage::new_binding_request);
        self.outbox.push_back((server, request.to_bytes()));
        self.next_send = Some(now + self.retry_interval);
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_send
    }

    /// Retry the outstanding request, or start a refresh
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.next_send {
            Some(deadline) if deadline <= now => {
                if self.request.is_none() {
                    debug!("Refreshing STUN binding");
                }
                self.send_request(now);
            }
            _ => {}
        }
    }

    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.outbox.pop_front()
    }

    /// Feed a received datagram.
    ///
    /// Only a Binding response carrying the magic cookie and the
    /// transaction id of the outstanding request is accepted.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> BindingOutcome {
        let Some(request) = &self.request else {
            return BindingOutcome::Ignored;
        };
        if !StunMessage::is_stun(data) {
            return BindingOutcome::Ignored;
        }
        let response = match StunMessage::from_bytes(data) {
            Ok(response) => response,
            Err(e) => {
                debug!("Dropping STUN datagram: {}", e);
                return BindingOutcome::Ignored;
            }
        };
        if response.transaction_id != request.transaction_id
            || response.message_type != StunMessageType::BindingResponse
        {
            return BindingOutcome::Ignored;
        }

        self.request = None;
        self.next_send = Some(now + self.refresh_interval);

        match response.reflexive_address() {
            Some(addr) if self.reflexive != Some(addr) => {
                info!("Discovered reflexive address {}", addr);
                self.reflexive = Some(addr);
                BindingOutcome::Changed(addr)
            }
            _ => BindingOutcome::Refreshed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        "198.51.100.1:3478".parse().unwrap()
    }

    fn binding() -> StunBinding {
        StunBinding::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    fn answer(request: &[u8], mapped: &str) -> Vec<u8> {
        let request = StunMessage::from_bytes(request).unwrap();
        StunMessage::new_binding_response(request.transaction_id, mapped.parse().unwrap())
            .to_bytes()
    }

    #[test]
    fn test_request_sent_on_server() {
        let now = Instant::now();
        let mut binding = binding();
        assert!(binding.poll_transmit().is_none());

        binding.set_server(server(), now);
        let (dest, bytes) = binding.poll_transmit().unwrap();

        assert_eq!(dest, server());
        assert_eq!(
            StunMessage::from_bytes(&bytes).unwrap().message_type,
            StunMessageType::BindingRequest
        );
        assert_eq!(binding.poll_timeout(), Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn test_retry_reuses_transaction() {
        let now = Instant::now();
        let mut binding = binding();
        binding.set_server(server(), now);
        let (_, first) = binding.poll_transmit().unwrap();

        binding.handle_timeout(now + Duration::from_millis(100));
        assert!(binding.poll_transmit().is_none());

        binding.handle_timeout(now + Duration::from_millis(500));
        let (_, second) = binding.poll_transmit().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_response_updates_address() {
        let now = Instant::now();
        let mut binding = binding();
        binding.set_server(server(), now);
        let (_, request) = binding.poll_transmit().unwrap();

        let outcome = binding.handle_datagram(&answer(&request, "203.0.113.5:40000"), now);
        assert_eq!(outcome, BindingOutcome::Changed("203.0.113.5:40000".parse().unwrap()));
        assert_eq!(binding.reflexive_address(), Some("203.0.113.5:40000".parse().unwrap()));
        assert_eq!(binding.poll_timeout(), Some(now + Duration::from_secs(30)));

        // duplicate response no longer matches
        let outcome = binding.handle_datagram(&answer(&request, "203.0.113.5:40000"), now);
        assert_eq!(outcome, BindingOutcome::Ignored);
    }

    #[test]
    fn test_refresh_detects_rebinding() {
        let now = Instant::now();
        let mut binding = binding();
        binding.set_server(server(), now);
        let (_, request) = binding.poll_transmit().unwrap();
        binding.handle_datagram(&answer(&request, "203.0.113.5:40000"), now);

        let later = now + Duration::from_secs(30);
        binding.handle_timeout(later);
        let (_, refresh) = binding.poll_transmit().unwrap();
        assert_ne!(refresh, request);

        assert_eq!(
            binding.handle_datagram(&answer(&refresh, "203.0.113.5:40000"), later),
            BindingOutcome::Refreshed
        );

        binding.handle_timeout(later + Duration::from_secs(30));
        let (_, refresh) = binding.poll_transmit().unwrap();
        assert_eq!(
            binding.handle_datagram(&answer(&refresh, "203.0.113.9:41000"), later),
            BindingOutcome::Changed("203.0.113.9:41000".parse().unwrap())
        );
    }

    #[test]
    fn test_foreign_transaction_ignored() {
        let now = Instant::now();
        let mut binding = binding();
        binding.set_server(server(), now);
        binding.poll_transmit();

        let other = StunMessage::new_binding_response([9u8; 12], "203.0.113.5:1".parse().unwrap());
        assert_eq!(binding.handle_datagram(&other.to_bytes(), now), BindingOutcome::Ignored);
        assert_eq!(binding.handle_datagram(b"SIP/2.0 200 OK\r\n\r\n", now), BindingOutcome::Ignored);
        assert!(binding.reflexive_address().is_none());
    }
}
