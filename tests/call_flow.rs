//! Two clients calling each other through a scripted registrar
//!
//! The registrar answers every REGISTER with a 200 and relays everything
//! else to the other client, the way a proxy serving both users would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use yakphone::config::PhoneConfig;
use yakphone::domain::call::{CallDirection, CallEvent, CallState};
use yakphone::domain::client::{ClientEvent, ClientState};
use yakphone::infrastructure::media::{key_tone, NullAudioDevices};
use yakphone::infrastructure::protocols::ice::{RTCP_COMPONENT, RTP_COMPONENT};
use yakphone::infrastructure::protocols::sip::{ClientAction, SipClient, SipMessage};

const SERVER: &str = "192.0.2.1:5060";

struct Peer {
    client: SipClient,
    media_ip: &'static str,
    media_port: u16,
    events: Vec<ClientEvent>,
}

impl Peer {
    fn new(username: &str, address: &str, media_ip: &'static str, media_port: u16) -> Self {
        let mut config = PhoneConfig::default();
        config.account.domain = "example.com".to_string();
        config.account.username = username.to_string();
        config.account.password = "secret".to_string();
        config.network.bind_address = address.parse().unwrap();

        let mut client = SipClient::new(&config, Arc::new(NullAudioDevices::default()));
        client.set_local_address(address.parse().unwrap());
        Self {
            client,
            media_ip,
            media_port,
            events: Vec::new(),
        }
    }

    fn call_events(&self, call_id: &str) -> Vec<CallEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Call { call_id: id, event } if id == call_id => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bind fake media sockets for every call that asks
    fn process_actions(&mut self, now: Instant) {
        while let Some(action) = self.client.poll_action() {
            if let ClientAction::BindMedia { call_id } = action {
                for (offset, component) in [(0, RTP_COMPONENT), (1, RTCP_COMPONENT)] {
                    let addr = SocketAddr::new(
                        self.media_ip.parse().unwrap(),
                        self.media_port + offset,
                    );
                    self.client.media_bound(&call_id, component, addr, now);
                }
            }
        }
    }
}

struct Network {
    alice: Peer,
    bob: Peer,
}

fn register_ok(request: &SipMessage) -> SipMessage {
    let mut response = SipMessage::new_response(200, "OK");
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        response.set_header_field(name, request.header_field(name));
    }
    response.set_header_field(
        "Contact",
        format!("{};expires=3600", request.header_field("Contact")),
    );
    response
}

impl Network {
    fn new() -> Self {
        Self {
            alice: Peer::new("alice", "10.0.0.1:5060", "10.0.0.1", 4000),
            bob: Peer::new("bob", "10.0.0.2:5060", "10.0.0.2", 5000),
        }
    }

    fn connect(&mut self, now: Instant) {
        for peer in [&mut self.alice, &mut self.bob] {
            peer.client.connect_to_server(now);
            peer.client.set_sip_server(SERVER.parse().unwrap(), now);
            peer.client.set_stun_server(None, now);
        }
        self.run(now);
        assert_eq!(self.alice.client.state(), ClientState::Connected);
        assert_eq!(self.bob.client.state(), ClientState::Connected);
    }

    /// Deliver messages back and forth until both sides are quiet;
    /// returns the relayed requests' methods and responses' codes
    fn run(&mut self, now: Instant) -> Vec<String> {
        let server: SocketAddr = SERVER.parse().unwrap();
        let mut trace = Vec::new();
        loop {
            self.alice.process_actions(now);
            self.bob.process_actions(now);

            let mut idle = true;
            for from_alice in [true, false] {
                let (sender, receiver) = if from_alice {
                    (&mut self.alice, &mut self.bob)
                } else {
                    (&mut self.bob, &mut self.alice)
                };
                while let Some((dest, data)) = sender.client.poll_transmit() {
                    idle = false;
                    assert_eq!(dest, server);
                    let message = SipMessage::parse(&data);
                    if message.method() == "REGISTER" {
                        sender
                            .client
                            .handle_datagram(&register_ok(&message).to_bytes(), server, now);
                        continue;
                    }
                    trace.push(if message.is_request() {
                        message.method().to_string()
                    } else {
                        message.status_code().to_string()
                    });
                    receiver.client.handle_datagram(&data, server, now);
                }
            }

            for peer in [&mut self.alice, &mut self.bob] {
                while let Some(event) = peer.client.poll_event() {
                    peer.events.push(event);
                }
            }
            if idle {
                return trace;
            }
        }
    }

    /// Carry RTP from one peer's media sockets to the other's
    fn run_media(&mut self, now: Instant) -> usize {
        let mut delivered = 0;
        for from_alice in [true, false] {
            let (sender, receiver) = if from_alice {
                (&mut self.alice, &mut self.bob)
            } else {
                (&mut self.bob, &mut self.alice)
            };
            while let Some((call_id, component, dest, data)) = sender.client.poll_media_transmit() {
                assert_eq!(dest.ip().to_string(), receiver.media_ip);
                let expected_port = receiver.media_port + (component - RTP_COMPONENT);
                assert_eq!(dest.port(), expected_port);
                receiver
                    .client
                    .handle_media_datagram(&call_id, component, &data, now);
                delivered += 1;
            }
        }
        delivered
    }
}

#[test]
fn test_call_answered_and_hung_up() {
    let now = Instant::now();
    let mut net = Network::new();
    net.connect(now);

    let call_id = net.alice.client.call("sip:bob@example.com").unwrap();
    let trace = net.run(now);
    assert_eq!(trace, ["INVITE", "180"]);
    assert!(net.alice.call_events(&call_id).contains(&CallEvent::Ringing));

    let incoming = net.bob.client.find_call(&call_id).unwrap();
    assert_eq!(incoming.direction(), CallDirection::Incoming);
    assert_eq!(incoming.state(), CallState::Offer);
    assert!(net.bob.events.iter().any(|e| matches!(
        e,
        ClientEvent::CallReceived { call_id: id, from } if *id == call_id && from.contains("sip:alice@example.com")
    )));

    net.bob.client.accept(&call_id, now).unwrap();
    let trace = net.run(now);
    assert_eq!(trace, ["200", "ACK"]);
    for peer in [&net.alice, &net.bob] {
        let call = peer.client.find_call(&call_id).unwrap();
        assert_eq!(call.state(), CallState::Active);
        let connected = peer
            .call_events(&call_id)
            .into_iter()
            .filter(|e| *e == CallEvent::Connected)
            .count();
        assert_eq!(connected, 1);
    }

    // audio flows both ways into the jitter buffers
    net.alice.client.pump_audio();
    net.bob.client.pump_audio();
    assert!(net.run_media(now) >= 2);
    assert!(net.alice.client.find_call(&call_id).unwrap().channel().buffered_bytes() > 0);
    assert!(net.bob.client.find_call(&call_id).unwrap().channel().buffered_bytes() > 0);

    // DTMF rides the RTP stream as telephone events and is not played out
    let buffered = net.bob.client.find_call(&call_id).unwrap().channel().buffered_bytes();
    let tone = key_tone('#').unwrap();
    net.alice.client.start_tone(tone).unwrap();
    net.alice.client.stop_tone(tone).unwrap();
    assert!(net.run_media(now) >= 4);
    assert_eq!(
        net.bob.client.find_call(&call_id).unwrap().channel().buffered_bytes(),
        buffered
    );
    assert!(net.alice.client.start_tone(16).is_err());

    let later = now + Duration::from_secs(3);
    assert_eq!(
        net.alice.client.find_call(&call_id).unwrap().duration(later),
        Duration::from_secs(3)
    );

    net.alice.client.hangup(&call_id, later).unwrap();
    let trace = net.run(later);
    assert_eq!(trace, ["BYE", "200"]);
    for peer in [&net.alice, &net.bob] {
        let call = peer.client.find_call(&call_id).unwrap();
        assert_eq!(call.state(), CallState::Finished);
        assert_eq!(call.error_string(), None);
        assert_eq!(peer.call_events(&call_id).last(), Some(&CallEvent::Finished));
    }

    // a second hangup is a no-op
    net.alice.client.hangup(&call_id, later).unwrap();
    assert!(net.run(later).is_empty());

    net.alice.client.release_call(&call_id).unwrap();
    assert!(net.alice.client.find_call(&call_id).is_none());
    assert!(net.alice.client.active_calls().is_empty());
}

#[test]
fn test_call_declined() {
    let now = Instant::now();
    let mut net = Network::new();
    net.connect(now);

    let call_id = net.alice.client.call("sip:bob@example.com").unwrap();
    net.run(now);

    net.bob.client.hangup(&call_id, now).unwrap();
    let trace = net.run(now);
    assert_eq!(trace[0], "603");

    let call = net.alice.client.find_call(&call_id).unwrap();
    assert_eq!(call.state(), CallState::Finished);
    assert!(call.error_string().is_some_and(|e| e.contains("603")));
    assert_eq!(
        net.bob.client.find_call(&call_id).unwrap().state(),
        CallState::Finished
    );
}

#[test]
fn test_caller_cancels_ringing_call() {
    let now = Instant::now();
    let mut net = Network::new();
    net.connect(now);

    let call_id = net.alice.client.call("sip:bob@example.com").unwrap();
    net.run(now);

    net.alice.client.hangup(&call_id, now).unwrap();
    let trace = net.run(now);
    assert_eq!(trace.first().map(String::as_str), Some("BYE"));
    assert!(trace.iter().any(|t| t == "CANCEL"));

    assert_eq!(
        net.alice.client.find_call(&call_id).unwrap().state(),
        CallState::Finished
    );
    assert_eq!(
        net.bob.client.find_call(&call_id).unwrap().state(),
        CallState::Finished
    );
}

#[test]
fn test_disconnect_hangs_up_calls() {
    let now = Instant::now();
    let mut net = Network::new();
    net.connect(now);

    let call_id = net.alice.client.call("sip:bob@example.com").unwrap();
    net.run(now);
    net.bob.client.accept(&call_id, now).unwrap();
    net.run(now);

    net.alice.client.disconnect_from_server(now);
    let trace = net.run(now);
    assert!(trace.contains(&"BYE".to_string()));
    assert_eq!(net.alice.client.state(), ClientState::Disconnected);
    assert_eq!(
        net.bob.client.find_call(&call_id).unwrap().state(),
        CallState::Finished
    );
    assert!(net.alice.client.call("sip:bob@example.com").is_err());
}
