//! SIP client
//!
//! Registers the account with its server, keeps the registration alive and
//! routes every received datagram to the registration, an existing call or
//! a new incoming call. Like [`SipCall`], the client is sans-IO: the driver
//! feeds it datagrams and timer ticks and drains what it wants sent.

use super::auth::UserCredentials;
use super::builder::UserAgent;
use super::call::{CallSettings, SipCall};
use super::context::SipCallContext;
use super::message::{sip_address_to_uri, SipError, SipMessage, SipMethod};
use super::transaction::{SipTimers, SipTransaction, TransactionTimerAction};
use crate::config::PhoneConfig;
use crate::domain::call::CallState;
use crate::domain::client::{ClientEvent, ClientState};
use crate::infrastructure::media::{AudioDevices, ChannelConfig, MAX_TONE};
use crate::infrastructure::protocols::stun::{BindingOutcome, StunBinding, StunMessage};
use metrics::{counter, gauge};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Work the client needs from its driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Resolve the SIP and STUN servers of a domain
    Resolve { domain: String },
    /// Bind the RTP and RTCP sockets of a call
    BindMedia { call_id: String },
    /// Close the media sockets of a removed call
    ReleaseMedia { call_id: String },
}

pub struct SipClient {
    ua: UserAgent,
    ctx: SipCallContext,
    state: ClientState,
    timers: SipTimers,
    call_settings: CallSettings,
    devices: Arc<dyn AudioDevices>,

    server: Option<SocketAddr>,
    stun: StunBinding,
    stun_resolved: bool,

    register_expires: u32,
    register_margin: u32,
    connect_retry: Duration,
    connect_deadline: Option<Instant>,
    register_deadline: Option<Instant>,

    transactions: Vec<SipTransaction>,
    calls: Vec<SipCall>,

    events: VecDeque<ClientEvent>,
    actions: VecDeque<ClientAction>,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl SipClient {
    pub fn new(config: &PhoneConfig, devices: Arc<dyn AudioDevices>) -> Self {
        let account = &config.account;
        let timers = SipTimers {
            t1: Duration::from_millis(config.timers.t1_ms),
            t2: Duration::from_millis(config.timers.t2_ms),
            t4: Duration::from_millis(config.timers.t4_ms),
        };
        let stun_retry = Duration::from_millis(config.timers.stun_retry_ms);
        let stun_refresh = Duration::from_millis(config.timers.stun_refresh_ms);

        let ua = UserAgent {
            domain: account.domain.clone(),
            username: account.username.clone(),
            display_name: account.display_name.clone(),
            credentials: UserCredentials {
                username: account.username.clone(),
                password: account.password.clone(),
            },
            user_agent: config.network.user_agent.clone(),
            local_addr: config.network.bind_address,
        };

        Self {
            ua,
            ctx: SipCallContext::new(),
            state: ClientState::Disconnected,
            timers,
            call_settings: CallSettings {
                timers,
                stun_server: None,
                stun_retry,
                stun_refresh,
                channel: ChannelConfig {
                    ptime_ms: config.media.ptime_ms,
                    min_frames: config.media.min_frames,
                    max_frames: config.media.max_frames,
                },
            },
            devices,
            server: None,
            stun: StunBinding::new(stun_retry, stun_refresh),
            stun_resolved: false,
            register_expires: config.timers.register_expires_secs,
            register_margin: config.timers.register_margin_secs,
            connect_retry: Duration::from_secs(config.timers.connect_retry_secs),
            connect_deadline: None,
            register_deadline: None,
            transactions: Vec::new(),
            calls: Vec::new(),
            events: VecDeque::new(),
            actions: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn user_agent(&self) -> &UserAgent {
        &self.ua
    }

    /// Address advertised in Via and Contact until STUN finds a better one
    pub fn set_local_address(&mut self, addr: SocketAddr) {
        self.ua.local_addr = addr;
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        debug!("Client state {} -> {}", self.state.name(), state.name());
        self.state = state;
        self.events.push_back(ClientEvent::StateChanged(state));
        match state {
            ClientState::Connected => self.events.push_back(ClientEvent::Connected),
            ClientState::Disconnected => self.events.push_back(ClientEvent::Disconnected),
            _ => {}
        }
    }

    /// Start (or retry) connecting: the driver resolves the domain and
    /// reports back through [`Self::set_sip_server`] and
    /// [`Self::set_stun_server`].
    pub fn connect_to_server(&mut self, now: Instant) {
        info!("Connecting to {}", self.ua.domain);
        self.connect_deadline = Some(now + self.connect_retry);
        self.actions.push_back(ClientAction::Resolve {
            domain: self.ua.domain.clone(),
        });
        if self.state == ClientState::Disconnected {
            self.set_state(ClientState::Connecting);
        }
    }

    pub fn set_sip_server(&mut self, server: SocketAddr, now: Instant) {
        debug!("SIP server is {}", server);
        self.server = Some(server);
        self.try_register(now);
    }

    /// Set the STUN server, `None` when there is none to use
    pub fn set_stun_server(&mut self, server: Option<SocketAddr>, now: Instant) {
        self.stun_resolved = true;
        self.call_settings.stun_server = server;
        match server {
            Some(server) => {
                debug!("STUN server is {}", server);
                self.stun.set_server(server, now);
            }
            None => self.try_register(now),
        }
    }

    /// Register once the server is known and, when STUN is in use, the
    /// reflexive address too
    fn try_register(&mut self, now: Instant) {
        if self.server.is_none() || !self.stun_resolved {
            return;
        }
        if self.call_settings.stun_server.is_some() && self.stun.reflexive_address().is_none() {
            return;
        }
        self.register(now);
    }

    fn register(&mut self, now: Instant) {
        self.transactions.clear();
        let seq = self.ctx.next_cseq();
        let uri = self.ua.server_uri();
        let mut request = self.ua.build_request(SipMethod::Register, &uri, &self.ctx, seq);
        request.set_header_field("Expires", self.register_expires.to_string());

        debug!("Registering {} with {}", self.ua.uri(), uri);
        if self.state != ClientState::Connected {
            self.set_state(ClientState::Connecting);
        }
        self.start_transaction(request, now);
    }

    fn start_transaction(&mut self, request: SipMessage, now: Instant) {
        self.send(request.clone());
        self.transactions
            .push(SipTransaction::new(request, self.timers, now));
    }

    fn send(&mut self, message: SipMessage) {
        let Some(server) = self.server else {
            warn!("Cannot send {}, SIP server is unknown", message.sequence_method());
            return;
        };
        debug!("Sending to {}:\n{}", server, message);
        counter!("sip_messages_sent_total").increment(1);
        self.outbox.push_back((server, message.to_bytes()));
    }

    fn handle_register_reply(&mut self, reply: &SipMessage, now: Instant) {
        let branch = reply.branch();
        let Some(pos) = self
            .transactions
            .iter()
            .position(|t| Some(t.branch()) == branch.as_deref())
        else {
            debug!("Ignoring reply for unknown transaction");
            return;
        };
        if self.transactions[pos].handle_response(reply) {
            let transaction = self.transactions.remove(pos);
            self.register_finished(transaction, now);
        }
    }

    fn register_finished(&mut self, transaction: SipTransaction, now: Instant) {
        let Some(reply) = transaction.response().cloned() else {
            self.register_failed(now);
            return;
        };

        match reply.status_code() {
            401 | 407 if self.ctx.handle_authentication(&reply) => {
                let request = self.ua.build_retry(transaction.request(), &mut self.ctx);
                self.start_transaction(request, now);
            }
            200 if self.state == ClientState::Disconnecting => {
                info!("Unregistered from {}", self.ua.domain);
                self.set_state(ClientState::Disconnected);
            }
            200 => {
                let expires = self.granted_expiry(&reply);
                let mut delay = expires - i64::from(self.register_margin);
                if delay <= 0 {
                    delay = (expires / 2).max(1);
                    warn!(
                        "Registration expiry of {} s is within the renewal margin, renewing after {} s",
                        expires, delay
                    );
                }
                info!("Registered as {} for {} s", self.ua.uri(), expires);
                self.connect_deadline = None;
                self.register_deadline = Some(now + Duration::from_secs(delay.unsigned_abs()));
                self.set_state(ClientState::Connected);
            }
            _ => self.register_failed(now),
        }
    }

    /// Expiry granted by a 200 to REGISTER
    fn granted_expiry(&self, reply: &SipMessage) -> i64 {
        let contact = self.ua.contact_uri();
        let expires = reply
            .header_field_values("Contact")
            .iter()
            .find(|value| sip_address_to_uri(value).as_deref() == Some(contact.as_str()))
            .and_then(|value| SipMessage::value_parameters(value).remove("expires"))
            .and_then(|value| value.parse::<i64>().ok())
            .or_else(|| reply.header_field("Expires").trim().parse().ok())
            .unwrap_or(0);
        if expires > 0 {
            expires
        } else {
            i64::from(self.register_expires)
        }
    }

    fn register_failed(&mut self, now: Instant) {
        warn!("Register failed");
        self.register_deadline = None;
        if self.state != ClientState::Disconnecting {
            self.connect_deadline = Some(now + self.connect_retry);
        }
        self.set_state(ClientState::Disconnected);
    }

    /// Hang up every call and unregister
    pub fn disconnect_from_server(&mut self, now: Instant) {
        info!("Disconnecting from {}", self.ua.domain);
        self.connect_deadline = None;
        self.register_deadline = None;
        self.stun.stop();
        for call in self.calls.iter_mut() {
            call.hangup(&self.ua, now);
        }

        self.transactions.clear();
        if self.state == ClientState::Connected {
            let seq = self.ctx.next_cseq();
            let uri = self.ua.server_uri();
            let mut request = self.ua.build_request(SipMethod::Register, &uri, &self.ctx, seq);
            request.set_header_field("Contact", format!("<{}>;expires=0", self.ua.contact_uri()));
            request.set_header_field("Expires", "0");
            self.set_state(ClientState::Disconnecting);
            self.start_transaction(request, now);
        } else {
            self.set_state(ClientState::Disconnected);
        }
        self.flush();
    }

    /// Place a call; returns its Call-ID
    pub fn call(&mut self, recipient: &str) -> Result<String, SipError> {
        if self.state != ClientState::Connected {
            warn!("Cannot dial call, not connected to server");
            return Err(SipError::NotConnected);
        }
        let call = SipCall::outgoing(recipient, &self.call_settings, self.devices.clone())?;
        let call_id = call.id().to_string();
        info!("Dialing {}", recipient);
        self.calls.push(call);

        self.actions.push_back(ClientAction::BindMedia {
            call_id: call_id.clone(),
        });
        self.events.push_back(ClientEvent::CallStarted {
            call_id: call_id.clone(),
        });
        self.events
            .push_back(ClientEvent::ActiveCallsChanged(self.calls.len()));
        self.flush();
        Ok(call_id)
    }

    fn call_mut<'a>(calls: &'a mut [SipCall], call_id: &str) -> Result<&'a mut SipCall, SipError> {
        calls
            .iter_mut()
            .find(|c| c.id() == call_id)
            .ok_or_else(|| SipError::UnknownCall(call_id.to_string()))
    }

    /// Answer an incoming call
    pub fn accept(&mut self, call_id: &str, now: Instant) -> Result<(), SipError> {
        Self::call_mut(&mut self.calls, call_id)?.accept(&self.ua, now)?;
        self.events.push_back(ClientEvent::CallStarted {
            call_id: call_id.to_string(),
        });
        self.flush();
        Ok(())
    }

    pub fn hangup(&mut self, call_id: &str, now: Instant) -> Result<(), SipError> {
        Self::call_mut(&mut self.calls, call_id)?.hangup(&self.ua, now);
        self.flush();
        Ok(())
    }

    /// Start sending a DTMF tone on every active call
    pub fn start_tone(&mut self, tone: u8) -> Result<(), SipError> {
        if tone > MAX_TONE {
            return Err(SipError::InvalidMessage(format!("Invalid tone: {}", tone)));
        }
        for call in self.calls.iter_mut().filter(|c| c.state() == CallState::Active) {
            if let Err(e) = call.start_tone(tone) {
                warn!("Call {} could not send tone {}: {}", call.id(), tone, e);
            }
        }
        Ok(())
    }

    /// Stop sending a DTMF tone on every active call
    pub fn stop_tone(&mut self, tone: u8) -> Result<(), SipError> {
        if tone > MAX_TONE {
            return Err(SipError::InvalidMessage(format!("Invalid tone: {}", tone)));
        }
        for call in self.calls.iter_mut().filter(|c| c.state() == CallState::Active) {
            call.stop_tone(tone);
        }
        Ok(())
    }

    /// Let the client drop the call once it has finished
    pub fn release_call(&mut self, call_id: &str) -> Result<(), SipError> {
        Self::call_mut(&mut self.calls, call_id)?.release();
        self.flush();
        Ok(())
    }

    pub fn find_call(&self, call_id: &str) -> Option<&SipCall> {
        self.calls.iter().find(|c| c.id() == call_id)
    }

    pub fn active_calls(&self) -> &[SipCall] {
        &self.calls
    }

    /// Feed a datagram received on the SIP socket
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        if StunMessage::is_stun(data) {
            if let BindingOutcome::Changed(addr) = self.stun.handle_datagram(data, now) {
                info!("Reflexive address is {}", addr);
                self.ua.local_addr = addr;
                self.ctx.clear_challenges();
                self.try_register(now);
            }
            return;
        }

        let message = SipMessage::parse(data);
        if !message.is_request() && !message.is_reply() {
            debug!("Dropping malformed SIP datagram from {}", from);
            return;
        }
        counter!("sip_messages_received_total").increment(1);
        debug!("Received from {}:\n{}", from, message);

        let call_id = message.header_field("Call-ID");
        if call_id == self.ctx.id() {
            if message.is_reply() {
                self.handle_register_reply(&message, now);
            }
        } else if let Some(pos) = self.calls.iter().position(|c| c.id() == call_id) {
            let call = &mut self.calls[pos];
            if message.is_reply() {
                call.handle_reply(&message, &self.ua, now);
            } else {
                call.handle_request(&message, &self.ua, now);
            }
        } else if message.is_request() && message.method() == SipMethod::Invite.as_str() {
            self.incoming_call(&message, now);
        } else {
            debug!("Dropping message for unknown call {}", call_id);
        }
        self.flush();
    }

    fn incoming_call(&mut self, invite: &SipMessage, now: Instant) {
        let mut call = SipCall::incoming(invite, &self.ua, &self.call_settings, self.devices.clone(), now);
        if call.state().is_finished() {
            while let Some(message) = call.poll_message() {
                self.send(message);
            }
            return;
        }

        let call_id = call.id().to_string();
        let from = call.recipient().to_string();
        info!("Incoming call {} from {}", call_id, from);
        self.calls.push(call);

        self.actions.push_back(ClientAction::BindMedia {
            call_id: call_id.clone(),
        });
        self.events
            .push_back(ClientEvent::CallReceived { call_id, from });
        self.events
            .push_back(ClientEvent::ActiveCallsChanged(self.calls.len()));
    }

    /// Feed a datagram received on one of a call's media sockets
    pub fn handle_media_datagram(&mut self, call_id: &str, component: u16, data: &[u8], now: Instant) {
        if let Some(call) = self.calls.iter_mut().find(|c| c.id() == call_id) {
            call.handle_media_datagram(component, data, &self.ua, now);
        }
        self.flush();
    }

    /// Report the local address of a call's media socket
    pub fn media_bound(&mut self, call_id: &str, component: u16, addr: SocketAddr, now: Instant) {
        if let Some(call) = self.calls.iter_mut().find(|c| c.id() == call_id) {
            call.media_bound(component, addr, &self.ua, now);
        }
        self.flush();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.register_deadline,
            self.stun.poll_timeout(),
            self.transactions.iter().filter_map(|t| t.next_deadline()).min(),
            self.calls.iter().filter_map(|c| c.poll_timeout()).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.connect_deadline.is_some_and(|d| d <= now) {
            self.connect_deadline = None;
            self.connect_to_server(now);
        }
        if self.register_deadline.is_some_and(|d| d <= now) {
            self.register_deadline = None;
            self.register(now);
        }
        self.stun.handle_timeout(now);

        let mut retransmit = Vec::new();
        for transaction in self.transactions.iter_mut() {
            for action in transaction.check_timers(now) {
                if action == TransactionTimerAction::RetransmitRequest {
                    retransmit.push(transaction.request().clone());
                }
            }
        }
        for request in retransmit {
            self.send(request);
        }
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transactions)
            .into_iter()
            .partition(|t| t.state().is_finished());
        self.transactions = pending;
        for transaction in finished {
            self.register_finished(transaction, now);
        }

        for call in self.calls.iter_mut() {
            call.handle_timeout(&self.ua, now);
        }
        self.flush();
    }

    /// Move audio for every active call
    pub fn pump_audio(&mut self) {
        for call in self.calls.iter_mut() {
            call.pump_audio();
        }
    }

    /// Next `(destination, datagram)` for the SIP socket
    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.stun.poll_transmit().or_else(|| self.outbox.pop_front())
    }

    /// Next `(call_id, component, destination, datagram)` for a media socket
    pub fn poll_media_transmit(&mut self) -> Option<(String, u16, SocketAddr, Vec<u8>)> {
        self.calls.iter_mut().find_map(|call| {
            call.poll_media_transmit()
                .map(|(component, dest, data)| (call.id().to_string(), component, dest, data))
        })
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn poll_action(&mut self) -> Option<ClientAction> {
        self.actions.pop_front()
    }

    /// Collect call output and drop released finished calls
    fn flush(&mut self) {
        let mut outgoing = Vec::new();
        for call in self.calls.iter_mut() {
            while let Some(message) = call.poll_message() {
                outgoing.push(message);
            }
            while let Some(event) = call.poll_event() {
                self.events.push_back(ClientEvent::Call {
                    call_id: call.id().to_string(),
                    event,
                });
            }
        }
        for message in outgoing {
            self.send(message);
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.calls)
            .into_iter()
            .partition(|c| c.is_released() && c.state().is_finished());
        self.calls = kept;
        if !removed.is_empty() {
            for call in removed {
                debug!("Call {} removed", call.id());
                self.actions.push_back(ClientAction::ReleaseMedia {
                    call_id: call.id().to_string(),
                });
            }
            self.events
                .push_back(ClientEvent::ActiveCallsChanged(self.calls.len()));
        }
        gauge!("sip_active_calls").set(self.calls.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::{CallEvent, CallState};
    use crate::infrastructure::media::NullAudioDevices;

    const SERVER: &str = "192.0.2.1:5060";

    fn config() -> PhoneConfig {
        let mut config = PhoneConfig::default();
        config.account.domain = "example.com".to_string();
        config.account.username = "alice".to_string();
        config.account.password = "secret".to_string();
        config.network.bind_address = "10.0.0.1:5060".parse().unwrap();
        config
    }

    fn client() -> SipClient {
        SipClient::new(&config(), Arc::new(NullAudioDevices::default()))
    }

    fn sent(client: &mut SipClient) -> Vec<SipMessage> {
        std::iter::from_fn(|| client.poll_transmit())
            .map(|(_, data)| SipMessage::parse(&data))
            .collect()
    }

    fn events(client: &mut SipClient) -> Vec<ClientEvent> {
        std::iter::from_fn(|| client.poll_event()).collect()
    }

    fn deliver(client: &mut SipClient, response: SipMessage, now: Instant) {
        client.handle_datagram(&response.to_bytes(), SERVER.parse().unwrap(), now);
    }

    fn response_for(request: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::new_response(code, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            response.set_header_field(name, request.header_field(name));
        }
        response
    }

    fn ok_for(request: &SipMessage, expires: Option<&str>) -> SipMessage {
        let mut response = response_for(request, 200, "OK");
        if let Some(expires) = expires {
            response.set_header_field(
                "Contact",
                format!("{};expires={}", request.header_field("Contact"), expires),
            );
        }
        response
    }

    fn challenge_for(request: &SipMessage, nonce: &str) -> SipMessage {
        let mut response = response_for(request, 401, "Unauthorized");
        response.set_header_field(
            "WWW-Authenticate",
            format!("Digest realm=\"example.com\", nonce=\"{}\"", nonce),
        );
        response
    }

    /// Client registered with `SERVER`, no STUN
    fn connected(now: Instant) -> SipClient {
        let mut client = client();
        client.connect_to_server(now);
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);
        let register = sent(&mut client).pop().unwrap();
        deliver(&mut client, ok_for(&register, Some("120")), now);
        assert_eq!(client.state(), ClientState::Connected);
        events(&mut client);
        while client.poll_action().is_some() {}
        client
    }

    #[test]
    fn test_connect_requests_resolution() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);

        assert_eq!(
            client.poll_action(),
            Some(ClientAction::Resolve { domain: "example.com".to_string() })
        );
        assert_eq!(client.state(), ClientState::Connecting);
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_register_waits_for_stun_resolution() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        assert!(sent(&mut client).is_empty());

        client.set_stun_server(None, now);
        let register = sent(&mut client);
        assert_eq!(register.len(), 1);
        assert_eq!(register[0].method(), "REGISTER");
        assert_eq!(register[0].uri(), "sip:example.com");
        assert_eq!(register[0].header_field("Expires"), "120");
        assert_eq!(register[0].sequence_number(), 1);
    }

    #[test]
    fn test_register_waits_for_reflexive_address() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(Some("192.0.2.2:3478".parse().unwrap()), now);

        let (dest, request) = client.poll_transmit().unwrap();
        assert_eq!(dest, "192.0.2.2:3478".parse().unwrap());
        assert!(client.poll_transmit().is_none());

        let request = StunMessage::from_bytes(&request).unwrap();
        let response = StunMessage::new_binding_response(
            request.transaction_id,
            "203.0.113.7:40000".parse().unwrap(),
        );
        client.handle_datagram(&response.to_bytes(), dest, now);

        let register = sent(&mut client).pop().unwrap();
        assert_eq!(register.method(), "REGISTER");
        assert_eq!(register.header_field("Contact"), "<sip:alice@203.0.113.7:40000>");
    }

    #[test]
    fn test_registration_and_renewal() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);
        let register = sent(&mut client).pop().unwrap();

        deliver(&mut client, ok_for(&register, Some("300")), now);
        assert_eq!(client.state(), ClientState::Connected);
        let events = events(&mut client);
        assert!(events.contains(&ClientEvent::Connected));
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(290)));

        client.handle_timeout(now + Duration::from_secs(290));
        let renewal = sent(&mut client).pop().unwrap();
        assert_eq!(renewal.method(), "REGISTER");
        assert_eq!(renewal.sequence_number(), 2);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn test_short_expiry_is_clamped() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);
        let register = sent(&mut client).pop().unwrap();

        deliver(&mut client, ok_for(&register, Some("8")), now);
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(4)));
    }

    #[test]
    fn test_expires_header_fallback() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);
        let register = sent(&mut client).pop().unwrap();

        let mut ok = ok_for(&register, None);
        ok.set_header_field("Contact", "<sip:someone-else@198.51.100.1>;expires=30");
        ok.set_header_field("Expires", "60");
        deliver(&mut client, ok, now);
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(50)));
    }

    #[test]
    fn test_authenticated_registration() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);
        let register = sent(&mut client).pop().unwrap();

        deliver(&mut client, challenge_for(&register, "n1"), now);
        let retry = sent(&mut client).pop().unwrap();
        assert_eq!(retry.sequence_number(), 2);
        assert!(retry.header_field("Authorization").starts_with("Digest "));

        deliver(&mut client, ok_for(&retry, Some("120")), now);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn test_wrong_password() {
        let now = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), now);
        client.set_stun_server(None, now);

        let mut registers = 0;
        let mut last = sent(&mut client).pop().unwrap();
        registers += 1;
        for _ in 0..3 {
            deliver(&mut client, challenge_for(&last, "same"), now);
            match sent(&mut client).pop() {
                Some(next) => {
                    registers += 1;
                    last = next;
                }
                None => break,
            }
        }

        assert_eq!(registers, 2);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(events(&mut client).contains(&ClientEvent::Disconnected));
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_register_timeout() {
        let start = Instant::now();
        let mut client = client();
        client.set_sip_server(SERVER.parse().unwrap(), start);
        client.set_stun_server(None, start);
        sent(&mut client);

        let mut now = start;
        while client.state() != ClientState::Disconnected && now < start + Duration::from_secs(60) {
            now = client.poll_timeout().unwrap();
            client.handle_timeout(now);
        }
        assert_eq!(now, start + Duration::from_secs(32));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_dial_requires_connection() {
        let now = Instant::now();
        let mut client = client();
        assert_eq!(client.call("sip:bob@example.com"), Err(SipError::NotConnected));

        let mut client = connected(now);
        let call_id = client.call("sip:bob@example.com").unwrap();
        assert_eq!(
            client.poll_action(),
            Some(ClientAction::BindMedia { call_id: call_id.clone() })
        );
        let started = events(&mut client);
        assert_eq!(started[0], ClientEvent::CallStarted { call_id: call_id.clone() });
        assert_eq!(started[1], ClientEvent::ActiveCallsChanged(1));
        assert!(client.find_call(&call_id).is_some());
        assert_eq!(client.call("bob"), Err(SipError::InvalidMessage("Invalid recipient: bob".to_string())));
    }

    #[test]
    fn test_incoming_invite_creates_call() {
        let now = Instant::now();
        let mut client = connected(now);

        let invite = b"INVITE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK-1\r\n\
            From: <sip:bob@example.com>;tag=b1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: incoming-1\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:bob@192.0.2.9:5060>\r\n\
            Content-Type: application/sdp\r\n\
            \r\n\
            v=0\r\nc=IN IP4 192.0.2.9\r\nt=0 0\r\nm=audio 7000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        client.handle_datagram(invite, SERVER.parse().unwrap(), now);

        assert_eq!(sent(&mut client).pop().unwrap().status_code(), 180);
        assert_eq!(
            client.poll_action(),
            Some(ClientAction::BindMedia { call_id: "incoming-1".to_string() })
        );
        let received = events(&mut client);
        assert_eq!(
            received[0],
            ClientEvent::CallReceived {
                call_id: "incoming-1".to_string(),
                from: "<sip:bob@example.com>;tag=b1".to_string(),
            }
        );

        client.hangup("incoming-1", now).unwrap();
        assert_eq!(sent(&mut client).pop().unwrap().status_code(), 603);
        assert_eq!(client.active_calls().len(), 1);

        client.release_call("incoming-1").unwrap();
        assert!(client.active_calls().is_empty());
        assert_eq!(
            client.poll_action(),
            Some(ClientAction::ReleaseMedia { call_id: "incoming-1".to_string() })
        );
        let released = events(&mut client);
        assert!(released.contains(&ClientEvent::Call {
            call_id: "incoming-1".to_string(),
            event: CallEvent::StateChanged(CallState::Finished),
        }));
        assert_eq!(released.last(), Some(&ClientEvent::ActiveCallsChanged(0)));
    }

    #[test]
    fn test_malformed_and_stray_messages_dropped() {
        let now = Instant::now();
        let mut client = connected(now);

        client.handle_datagram(b"garbage", SERVER.parse().unwrap(), now);
        client.handle_datagram(
            b"BYE sip:alice@10.0.0.1 SIP/2.0\r\nCall-ID: nobody\r\nCSeq: 2 BYE\r\n\r\n",
            SERVER.parse().unwrap(),
            now,
        );
        assert!(sent(&mut client).is_empty());
        assert!(events(&mut client).is_empty());
        assert_eq!(client.hangup("nobody", now), Err(SipError::UnknownCall("nobody".to_string())));
    }

    #[test]
    fn test_disconnect_unregisters() {
        let now = Instant::now();
        let mut client = connected(now);

        client.disconnect_from_server(now);
        let unregister = sent(&mut client).pop().unwrap();
        assert_eq!(unregister.method(), "REGISTER");
        assert_eq!(unregister.header_field("Contact"), "<sip:alice@10.0.0.1:5060>;expires=0");
        assert_eq!(unregister.header_field("Expires"), "0");
        assert_eq!(client.state(), ClientState::Disconnecting);

        deliver(&mut client, ok_for(&unregister, None), now);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.poll_timeout().is_none());
    }

    #[test]
    fn test_challenged_unregister_retry_keeps_zero_expiry() {
        let now = Instant::now();
        let mut client = connected(now);

        client.disconnect_from_server(now);
        let unregister = sent(&mut client).pop().unwrap();
        deliver(&mut client, challenge_for(&unregister, "fresh"), now);

        let retry = sent(&mut client).pop().unwrap();
        assert_eq!(retry.method(), "REGISTER");
        assert_eq!(retry.sequence_number(), unregister.sequence_number() + 1);
        assert!(retry.header_field("Authorization").starts_with("Digest "));
        assert_eq!(retry.header_field("Contact"), "<sip:alice@10.0.0.1:5060>;expires=0");
        assert_eq!(retry.header_field("Expires"), "0");
        assert_eq!(client.state(), ClientState::Disconnecting);

        deliver(&mut client, ok_for(&retry, None), now);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.poll_timeout().is_none());
    }
}
