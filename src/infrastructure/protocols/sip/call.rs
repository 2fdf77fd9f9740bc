//! SIP call
//!
//! One dialog and its media session. The call never touches a socket:
//! SIP messages it wants sent are queued for its client, media datagrams
//! are queued on its ICE connection, and every method is handed the
//! current time.
//!
//! ```text
//! outgoing:  Offer --INVITE--> Connecting --200+SDP--> Active --hangup--> Disconnecting
//! incoming:  Offer --accept--> Connecting --ACK-->     Active --BYE-->    Finished
//! ```

use super::builder::UserAgent;
use super::context::SipCallContext;
use super::message::{sip_address_to_uri, SipError, SipMessage, SipMethod};
use super::sdp::SdpMessage;
use super::transaction::{ActiveTimer, SipTimers, SipTransaction, TimerType, TransactionTimerAction};
use crate::domain::call::{CallDirection, CallEvent, CallState};
use crate::infrastructure::media::{
    AudioDevices, AudioPipeline, ChannelConfig, PayloadType, RtpAudioChannel,
};
use crate::infrastructure::protocols::ice::{
    CandidateType, IceCandidate, IceConnection, RTCP_COMPONENT, RTP_COMPONENT,
};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;
const SDP_CONTENT_TYPE: &str = "application/sdp";
const ALLOW: &str = "INVITE, ACK, CANCEL, OPTIONS, BYE";

/// Settings a call inherits from its client
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub timers: SipTimers,
    pub stun_server: Option<SocketAddr>,
    pub stun_retry: Duration,
    pub stun_refresh: Duration,
    pub channel: ChannelConfig,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            timers: SipTimers::default(),
            stun_server: None,
            stun_retry: Duration::from_millis(500),
            stun_refresh: Duration::from_secs(30),
            channel: ChannelConfig::default(),
        }
    }
}

fn address_to_sdp(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(_) => format!("IN IP4 {}", ip),
        IpAddr::V6(_) => format!("IN IP6 {}", ip),
    }
}

fn has_sdp(message: &SipMessage) -> bool {
    message.header_field("Content-Type") == SDP_CONTENT_TYPE
}

pub struct SipCall {
    ctx: SipCallContext,
    direction: CallDirection,
    state: CallState,
    timers: SipTimers,

    /// Name-addr used in the To header of our requests
    remote_recipient: String,
    /// Request-URI for in-dialog requests
    remote_uri: String,
    /// Route set, in the order Route headers are sent
    remote_route: Vec<String>,
    active_time: String,

    invite: Option<SipMessage>,
    last_response: Option<SipMessage>,
    invite_queued: bool,
    answer_queued: bool,
    invite_pending: bool,
    /// Timer A (INVITE) or Timer G (2xx)
    retransmit_timer: Option<ActiveTimer>,
    /// Timer B (INVITE) or Timer H (ACK wait)
    timeout_timer: Option<ActiveTimer>,
    transactions: Vec<SipTransaction>,

    ice: IceConnection,
    channel: RtpAudioChannel,
    devices: Arc<dyn AudioDevices>,
    audio: Option<AudioPipeline>,

    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<String>,
    released: bool,

    outbox: VecDeque<SipMessage>,
    events: VecDeque<CallEvent>,
}

impl SipCall {
    fn new(
        ctx: SipCallContext,
        direction: CallDirection,
        remote_recipient: String,
        remote_uri: String,
        settings: &CallSettings,
        devices: Arc<dyn AudioDevices>,
    ) -> Self {
        Self {
            ctx,
            direction,
            state: CallState::Offer,
            timers: settings.timers,
            remote_recipient,
            remote_uri,
            remote_route: Vec::new(),
            active_time: "0 0".to_string(),
            invite: None,
            last_response: None,
            invite_queued: false,
            answer_queued: false,
            invite_pending: false,
            retransmit_timer: None,
            timeout_timer: None,
            transactions: Vec::new(),
            ice: IceConnection::new(settings.stun_server, settings.stun_retry, settings.stun_refresh),
            channel: RtpAudioChannel::new(settings.channel),
            devices,
            audio: None,
            started_at: None,
            finished_at: None,
            error: None,
            released: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Create a call to `recipient`, a SIP URI or name-addr.
    ///
    /// The INVITE goes out once media candidates have been gathered.
    pub fn outgoing(
        recipient: &str,
        settings: &CallSettings,
        devices: Arc<dyn AudioDevices>,
    ) -> Result<Self, SipError> {
        let recipient = recipient.trim();
        let (remote_recipient, remote_uri) = match sip_address_to_uri(recipient) {
            Some(uri) => (recipient.to_string(), uri),
            None => {
                let address = format!("<{}>", recipient);
                let uri = sip_address_to_uri(&address).ok_or_else(|| {
                    SipError::InvalidMessage(format!("Invalid recipient: {}", recipient))
                })?;
                (address, uri)
            }
        };

        let mut call = Self::new(
            SipCallContext::new(),
            CallDirection::Outgoing,
            remote_recipient,
            remote_uri,
            settings,
            devices,
        );
        call.invite_queued = true;
        Ok(call)
    }

    /// Create a call for a received INVITE and answer it with 180 Ringing,
    /// or 400 if its offer is unusable (the call is then finished).
    pub fn incoming(
        invite: &SipMessage,
        ua: &UserAgent,
        settings: &CallSettings,
        devices: Arc<dyn AudioDevices>,
        now: Instant,
    ) -> Self {
        let mut ctx = SipCallContext::with_id(invite.header_field("Call-ID"));
        let mut invite = invite.clone();

        // our responses carry the dialog tag in To
        let to = invite.header_field("To");
        match SipMessage::value_parameters(&to).remove("tag") {
            Some(tag) => ctx.set_tag(tag),
            None => invite.set_header_field("To", format!("{};tag={}", to, ctx.tag())),
        }

        let from = invite.header_field("From");
        let remote_uri = sip_address_to_uri(&from).unwrap_or_default();
        let mut call = Self::new(ctx, CallDirection::Incoming, from, remote_uri, settings, devices);
        call.handle_request(&invite, ua, now);
        call
    }

    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Remote party as a name-addr
    pub fn recipient(&self) -> &str {
        &self.remote_recipient
    }

    /// Reason the call failed, if it did
    pub fn error_string(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Time spent in the active state
    pub fn duration(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(start) => self.finished_at.unwrap_or(now).saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    pub fn ice(&self) -> &IceConnection {
        &self.ice
    }

    pub fn channel(&self) -> &RtpAudioChannel {
        &self.channel
    }

    pub(crate) fn release(&mut self) {
        self.released = true;
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    fn set_state(&mut self, state: CallState, now: Instant) {
        if self.state == state {
            return;
        }
        if let Err(e) = self.state.validate_transition(state) {
            debug!("Call {} ignoring {}", self.id(), e);
            return;
        }

        let old = self.state;
        self.state = state;
        debug!("Call {} state {} -> {}", self.id(), old.name(), state.name());
        self.events.push_back(CallEvent::StateChanged(state));

        if old == CallState::Active {
            self.audio = None;
        }
        match state {
            CallState::Active => {
                self.started_at = Some(now);
                self.audio = AudioPipeline::open(self.devices.as_ref(), &self.channel);
                self.events.push_back(CallEvent::Connected);
            }
            CallState::Finished => {
                info!("Call {} finished", self.id());
                self.finished_at = Some(now);
                self.retransmit_timer = None;
                self.timeout_timer = None;
                self.invite_queued = false;
                self.answer_queued = false;
                self.transactions.clear();
                self.ice.close();
                self.channel.close();
                self.events.push_back(CallEvent::Finished);
            }
            _ => {}
        }
    }

    fn fail(&mut self, reason: impl Into<String>, now: Instant) {
        self.error = Some(reason.into());
        self.set_state(CallState::Finished, now);
    }

    /// Answer an incoming call
    pub fn accept(&mut self, ua: &UserAgent, now: Instant) -> Result<(), SipError> {
        if self.direction != CallDirection::Incoming || self.state != CallState::Offer {
            return Err(SipError::InvalidState(format!(
                "Cannot accept call in state {}",
                self.state.name()
            )));
        }
        if self.ice.is_gathering_complete() {
            self.send_answer(ua, now);
        } else {
            debug!("Call {} answer queued until candidates are gathered", self.id());
            self.answer_queued = true;
        }
        Ok(())
    }

    /// Hang up the call; a no-op once it is disconnecting or finished
    pub fn hangup(&mut self, ua: &UserAgent, now: Instant) {
        match self.state {
            CallState::Disconnecting | CallState::Finished => return,
            CallState::Offer if self.direction == CallDirection::Incoming => {
                debug!("Call {} declined", self.id());
                self.respond_to_invite(ua, 603, "Decline");
                self.set_state(CallState::Finished, now);
                return;
            }
            CallState::Offer => {
                // INVITE never sent
                self.set_state(CallState::Finished, now);
                return;
            }
            _ => {}
        }

        debug!("Call {} hangup", self.id());
        self.set_state(CallState::Disconnecting, now);
        self.ice.close();
        self.channel.close();
        self.retransmit_timer = None;
        self.timeout_timer = None;

        let seq = self.ctx.next_cseq();
        let mut request = ua.build_request(SipMethod::Bye, &self.remote_uri, &self.ctx, seq);
        request.set_header_field("To", self.remote_recipient.as_str());
        for route in &self.remote_route {
            request.add_header_field("Route", route.as_str());
        }
        self.start_transaction(request, now);
    }

    /// Record the local socket of a media component
    pub(crate) fn media_bound(&mut self, component: u16, addr: SocketAddr, ua: &UserAgent, now: Instant) {
        self.ice.media_bound(component, addr, now);
        self.gathering_progress(ua, now);
    }

    /// Feed a datagram received on one of the call's media sockets
    pub(crate) fn handle_media_datagram(
        &mut self,
        component: u16,
        data: &[u8],
        ua: &UserAgent,
        now: Instant,
    ) {
        if self.ice.handle_datagram(component, data, now) {
            self.gathering_progress(ua, now);
            return;
        }
        if component != RTP_COMPONENT || self.state != CallState::Active {
            return;
        }
        if let Err(e) = self.channel.datagram_received(data) {
            debug!("Call {} dropping RTP datagram: {}", self.id(), e);
        }
    }

    /// Send whatever was waiting for candidate gathering
    fn gathering_progress(&mut self, ua: &UserAgent, now: Instant) {
        if !self.ice.is_gathering_complete() {
            return;
        }
        if self.invite_queued {
            self.invite_queued = false;
            self.send_invite(ua, now);
        }
        if self.answer_queued {
            self.answer_queued = false;
            if self.state == CallState::Offer {
                self.send_answer(ua, now);
            }
        }
    }

    fn send_invite(&mut self, ua: &UserAgent, now: Instant) {
        let sdp = self.build_sdp(ua);

        let seq = self.ctx.next_cseq();
        let mut request = ua.build_request(SipMethod::Invite, &self.remote_uri, &self.ctx, seq);
        request.set_header_field("To", self.remote_recipient.as_str());
        request.set_header_field("Content-Type", SDP_CONTENT_TYPE);
        request.set_body(sdp.to_bytes());

        info!("Call {} to {}", self.id(), self.remote_recipient);
        self.start_invite(request, now);
        self.set_state(CallState::Connecting, now);
    }

    fn start_invite(&mut self, request: SipMessage, now: Instant) {
        self.outbox.push_back(request.clone());
        self.invite = Some(request);
        self.invite_pending = true;
        self.retransmit_timer = Some(ActiveTimer::start(TimerType::TimerA, &self.timers, now));
        self.timeout_timer = Some(ActiveTimer::start(TimerType::TimerB, &self.timers, now));
    }

    fn send_answer(&mut self, ua: &UserAgent, now: Instant) {
        let Some(invite) = &self.invite else {
            return;
        };
        let sdp = self.build_sdp(ua);

        let mut response = ua.build_response(invite, 200, "OK");
        response.set_header_field("Allow", ALLOW);
        response.set_header_field("Supported", "replaces");
        response.set_header_field("Content-Type", SDP_CONTENT_TYPE);
        response.set_body(sdp.to_bytes());
        self.last_response = Some(response.clone());
        self.outbox.push_back(response);

        self.retransmit_timer = Some(ActiveTimer::start(TimerType::TimerG, &self.timers, now));
        self.timeout_timer = Some(ActiveTimer::start(TimerType::TimerH, &self.timers, now));
        self.set_state(CallState::Connecting, now);
    }

    fn respond_to_invite(&mut self, ua: &UserAgent, code: u16, reason: &str) {
        if let Some(invite) = &self.invite {
            let response = ua.build_response(invite, code, reason);
            self.last_response = Some(response.clone());
            self.outbox.push_back(response);
        }
    }

    fn start_transaction(&mut self, request: SipMessage, now: Instant) {
        self.outbox.push_back(request.clone());
        self.transactions
            .push(SipTransaction::new(request, self.timers, now));
    }

    fn transaction_finished(&mut self, transaction: SipTransaction, ua: &UserAgent, now: Instant) {
        match transaction.request().method() {
            "BYE" if self.invite_pending => {
                let Some(invite) = self.invite.clone() else {
                    return;
                };
                let mut request = ua.build_request(
                    SipMethod::Cancel,
                    invite.uri(),
                    &self.ctx,
                    invite.sequence_number(),
                );
                request.set_header_field("To", invite.header_field("To"));
                request.set_header_field("Via", invite.header_field("Via"));
                request.remove_header_field("Contact");
                self.start_transaction(request, now);
            }
            "BYE" | "CANCEL" => self.set_state(CallState::Finished, now),
            _ => {}
        }
    }

    fn send_ack(&mut self, ua: &UserAgent) {
        let Some(invite) = &self.invite else {
            return;
        };
        let mut request =
            ua.build_request(SipMethod::Ack, &self.remote_uri, &self.ctx, invite.sequence_number());
        for route in &self.remote_route {
            request.add_header_field("Route", route.as_str());
        }
        request.set_header_field("To", self.remote_recipient.as_str());
        request.set_header_field("Via", invite.header_field("Via"));
        request.remove_header_field("Contact");
        self.outbox.push_back(request);
    }

    /// Handle a response addressed to this call
    pub(crate) fn handle_reply(&mut self, reply: &SipMessage, ua: &UserAgent, now: Instant) {
        let to = reply.header_field("To");
        if !to.is_empty() {
            self.remote_recipient = to;
        }
        if let Some(uri) = sip_address_to_uri(&reply.header_field("Contact")) {
            self.remote_uri = uri;
        }
        let routes = reply.header_field_values("Record-Route");
        if !routes.is_empty() {
            self.remote_route = routes.into_iter().rev().collect();
        }

        // BYE and CANCEL transactions
        let branch = reply.branch();
        let method = reply.sequence_method();
        if let Some(pos) = self.transactions.iter().position(|t| {
            Some(t.branch()) == branch.as_deref() && t.request().method() == method
        }) {
            if self.transactions[pos].handle_response(reply) {
                let transaction = self.transactions.remove(pos);
                self.transaction_finished(transaction, ua, now);
            }
            return;
        }

        if method != "INVITE" || self.direction != CallDirection::Outgoing {
            return;
        }
        let Some(invite) = &self.invite else {
            return;
        };
        if reply.sequence_number() != invite.sequence_number() {
            debug!("Call {} ignoring response to a previous INVITE", self.id());
            return;
        }

        let code = reply.status_code();
        self.retransmit_timer = None;
        if code >= 200 {
            self.invite_pending = false;
            self.timeout_timer = None;
            self.send_ack(ua);
        }

        if matches!(code, 401 | 407) && self.state == CallState::Connecting {
            if self.ctx.handle_authentication(reply) {
                if let Some(invite) = self.invite.clone() {
                    let request = ua.build_retry(&invite, &mut self.ctx);
                    self.start_invite(request, now);
                }
            } else {
                self.fail("Authentication failed", now);
            }
            return;
        }

        match code {
            180 => {
                if self.state == CallState::Connecting {
                    self.events.push_back(CallEvent::Ringing);
                }
            }
            200..=299 => {
                if self.state != CallState::Connecting {
                    return;
                }
                if has_sdp(reply) && self.handle_sdp(&SdpMessage::parse(reply.body())) {
                    info!("Call {} established", self.id());
                    self.set_state(CallState::Active, now);
                } else {
                    warn!("Call {}: Invalid SDP descriptor", self.id());
                    self.error = Some("Invalid SDP descriptor".to_string());
                    self.hangup(ua, now);
                }
            }
            300.. => {
                if self.state == CallState::Connecting {
                    warn!("Call {} failed: {} {}", self.id(), code, reply.reason_phrase());
                    self.fail(format!("{} {}", code, reply.reason_phrase()), now);
                }
            }
            _ => {}
        }
    }

    /// Handle a request addressed to this call
    pub(crate) fn handle_request(&mut self, request: &SipMessage, ua: &UserAgent, now: Instant) {
        let from = request.header_field("From");
        if !from.is_empty() {
            self.remote_recipient = from;
        }
        if let Some(uri) = sip_address_to_uri(&request.header_field("Contact")) {
            self.remote_uri = uri;
        }
        let routes = request.header_field_values("Record-Route");
        if !routes.is_empty() {
            self.remote_route = routes;
        }

        match request.method() {
            "ACK" => {
                if self.direction != CallDirection::Incoming || self.state != CallState::Connecting {
                    return;
                }
                self.retransmit_timer = None;
                self.timeout_timer = None;
                if self.channel.is_open() {
                    self.set_state(CallState::Active, now);
                } else {
                    self.set_state(CallState::Finished, now);
                }
            }
            "BYE" => {
                self.outbox.push_back(ua.build_response(request, 200, "OK"));
                self.set_state(CallState::Finished, now);
            }
            "CANCEL" => {
                self.outbox.push_back(ua.build_response(request, 200, "OK"));
                if self.direction == CallDirection::Incoming && self.state == CallState::Offer {
                    self.respond_to_invite(ua, 487, "Request Terminated");
                }
                self.set_state(CallState::Finished, now);
            }
            "INVITE" => self.handle_invite(request, ua, now),
            _ => {
                self.outbox
                    .push_back(ua.build_response(request, 405, "Method not allowed"));
            }
        }
    }

    fn handle_invite(&mut self, request: &SipMessage, ua: &UserAgent, now: Instant) {
        if let Some(invite) = &self.invite {
            if request.sequence_number() == invite.sequence_number() {
                if let Some(response) = self.last_response.clone() {
                    debug!("Call {} resending response to INVITE", self.id());
                    self.outbox.push_back(response);
                }
            } else {
                self.outbox
                    .push_back(ua.build_response(request, 488, "Not Acceptable Here"));
            }
            return;
        }

        self.invite = Some(request.clone());
        if has_sdp(request) && self.handle_sdp(&SdpMessage::parse(request.body())) {
            self.respond_to_invite(ua, 180, "Ringing");
        } else {
            warn!("Call {}: Invalid SDP descriptor", self.id());
            self.respond_to_invite(ua, 400, "Bad request");
            self.fail("Invalid SDP descriptor", now);
        }
    }

    fn build_sdp(&self, ua: &UserAgent) -> SdpMessage {
        let ntp = (chrono::Utc::now().timestamp() + NTP_UNIX_OFFSET).to_string();
        let media = self
            .ice
            .default_candidate(RTP_COMPONENT)
            .map(|c| c.address)
            .unwrap_or(ua.local_addr);

        let mut sdp = SdpMessage::new();
        sdp.add_field('v', "0");
        sdp.add_field('o', format!("- {} {} {}", ntp, ntp, address_to_sdp(ua.local_addr.ip())));
        sdp.add_field('s', "-");
        sdp.add_field('c', address_to_sdp(media.ip()));
        sdp.add_field('t', self.active_time.as_str());

        sdp.add_field('a', format!("ice-ufrag:{}", self.ice.local_user()));
        sdp.add_field('a', format!("ice-pwd:{}", self.ice.local_password()));

        let payloads = self.channel.local_payload_types();
        let ids: Vec<String> = payloads.iter().map(|p| p.id.to_string()).collect();
        sdp.add_field('m', format!("audio {} RTP/AVP {}", media.port(), ids.join(" ")));
        for payload in payloads {
            sdp.add_field('a', format!("rtpmap:{}", payload.rtpmap()));
            if payload.is_telephone_event() {
                sdp.add_field('a', format!("fmtp:{} 0-15", payload.id));
            }
        }
        sdp.add_field('a', "sendrecv");

        for candidate in self.ice.local_candidates() {
            sdp.add_field('a', candidate.to_sdp());
        }
        sdp
    }

    /// Apply a remote offer or answer.
    ///
    /// Returns `false` if no codec could be negotiated.
    fn handle_sdp(&mut self, sdp: &SdpMessage) -> bool {
        let mut host: Option<IpAddr> = None;
        let mut port: Option<u16> = None;
        let mut payloads: Vec<PayloadType> = Vec::new();

        for (tag, value) in sdp.fields() {
            match *tag {
                'c' => {
                    if let Some(addr) = value
                        .strip_prefix("IN IP4 ")
                        .or_else(|| value.strip_prefix("IN IP6 "))
                    {
                        host = addr.trim().parse().ok();
                    }
                }
                'm' => {
                    let bits: Vec<&str> = value.split(' ').collect();
                    if bits.len() < 3 || bits[0] != "audio" || bits[2] != "RTP/AVP" {
                        continue;
                    }
                    port = bits[1].parse().ok();
                    payloads = bits[3..]
                        .iter()
                        .filter_map(|id| id.parse::<u8>().ok())
                        .map(PayloadType::from_id)
                        .collect();
                }
                'a' => {
                    let Some((name, attr)) = value.split_once(':') else {
                        continue;
                    };
                    match name {
                        "ice-ufrag" => self.ice.set_remote_user(attr),
                        "ice-pwd" => self.ice.set_remote_password(attr),
                        "candidate" => {
                            if let Some(candidate) = IceCandidate::from_sdp(attr) {
                                self.ice.add_remote_candidate(candidate);
                            }
                        }
                        "ptime" => {
                            if let Some(ptime) = attr.trim().parse::<u32>().ok().filter(|p| *p > 0) {
                                debug!("Setting RTP payload time to {} ms", ptime);
                                for payload in payloads.iter_mut() {
                                    payload.ptime = ptime;
                                }
                            }
                        }
                        "rtpmap" => {
                            for payload in payloads.iter_mut() {
                                payload.apply_rtpmap(attr);
                            }
                        }
                        _ => {}
                    }
                }
                't' => {
                    if self.direction == CallDirection::Incoming {
                        self.active_time = value.clone();
                    } else if *value != self.active_time {
                        warn!("Answerer replied with a different active time {}", value);
                    }
                }
                _ => {}
            }
        }

        // legacy peers only advertise c= and m=
        if let (Some(host), Some(port)) = (host, port) {
            self.ice.add_remote_candidate(IceCandidate::new(
                CandidateType::Host,
                SocketAddr::new(host, port),
                RTP_COMPONENT,
            ));
            if let Some(rtcp_port) = port.checked_add(1) {
                self.ice.add_remote_candidate(IceCandidate::new(
                    CandidateType::Host,
                    SocketAddr::new(host, rtcp_port),
                    RTCP_COMPONENT,
                ));
            }
        }

        if !self.channel.set_remote_payload_types(&payloads) {
            warn!("Could not assign codec to RTP channel");
            return false;
        }
        true
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.retransmit_timer.as_ref().map(|t| t.expires_at),
            self.timeout_timer.as_ref().map(|t| t.expires_at),
            self.transactions.iter().filter_map(|t| t.next_deadline()).min(),
            self.ice.poll_timeout(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub(crate) fn handle_timeout(&mut self, ua: &UserAgent, now: Instant) {
        if self.timeout_timer.as_ref().is_some_and(|t| t.is_expired(now)) {
            match self.direction {
                CallDirection::Outgoing => {
                    warn!("Call {}: Outgoing call timed out", self.id());
                    self.invite_pending = false;
                    self.fail("Outgoing call timed out", now);
                }
                CallDirection::Incoming => {
                    warn!("Call {}: no ACK received", self.id());
                    self.fail("No ACK received", now);
                }
            }
        }

        let t2 = self.timers.t2;
        let cap = TimerType::TimerB.default_duration(&self.timers);
        if let Some(timer) = self.retransmit_timer.as_mut() {
            if timer.is_expired(now) {
                let (message, cap) = match self.direction {
                    CallDirection::Outgoing => (self.invite.clone(), cap),
                    CallDirection::Incoming => (self.last_response.clone(), t2),
                };
                timer.backoff(now, cap);
                if let Some(message) = message {
                    debug!("Call {} retransmitting {}", self.ctx.id(), message.sequence_method());
                    self.outbox.push_back(message);
                }
            }
        }

        let mut finished = Vec::new();
        for transaction in self.transactions.iter_mut() {
            for action in transaction.check_timers(now) {
                match action {
                    TransactionTimerAction::RetransmitRequest => {
                        self.outbox.push_back(transaction.request().clone());
                    }
                    TransactionTimerAction::Timeout => finished.push(transaction.branch().to_string()),
                }
            }
        }
        for branch in finished {
            if let Some(pos) = self.transactions.iter().position(|t| t.branch() == branch) {
                let transaction = self.transactions.remove(pos);
                self.transaction_finished(transaction, ua, now);
            }
        }

        self.ice.handle_timeout(now);
    }

    /// Move audio between the devices and the RTP channel
    pub(crate) fn pump_audio(&mut self) {
        if self.state != CallState::Active {
            return;
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.pump(&mut self.channel);
        }
        self.send_media();
    }

    fn send_media(&mut self) {
        while let Some(packet) = self.channel.poll_transmit() {
            self.ice.send_datagram(RTP_COMPONENT, packet.to_vec());
        }
    }

    /// Start sending a DTMF tone on an active call
    pub fn start_tone(&mut self, tone: u8) -> Result<(), SipError> {
        if self.state != CallState::Active {
            return Err(SipError::InvalidState(format!(
                "Cannot send tone in state {}",
                self.state.name()
            )));
        }
        self.channel
            .start_tone(tone)
            .map_err(|e| SipError::Media(e.to_string()))?;
        self.send_media();
        Ok(())
    }

    /// Stop sending a DTMF tone
    pub fn stop_tone(&mut self, tone: u8) {
        self.channel.stop_tone(tone);
        self.send_media();
    }

    /// Next SIP message for the client to send
    pub(crate) fn poll_message(&mut self) -> Option<SipMessage> {
        self.outbox.pop_front()
    }

    /// Next `(component, destination, datagram)` for the media sockets
    pub(crate) fn poll_media_transmit(&mut self) -> Option<(u16, SocketAddr, Vec<u8>)> {
        self.ice.poll_transmit()
    }

    pub fn poll_event(&mut self) -> Option<CallEvent> {
        self.events.pop_front()
    }
}
