//! Registration against a registrar that checks digest credentials

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use yakphone::config::PhoneConfig;
use yakphone::domain::client::{ClientEvent, ClientState};
use yakphone::infrastructure::media::NullAudioDevices;
use yakphone::infrastructure::protocols::sip::{ClientAction, SipClient, SipMessage};

const SERVER: &str = "192.0.2.1:5060";
const REALM: &str = "example.com";

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input))
}

fn digest_params(header: &str) -> HashMap<String, String> {
    header
        .trim_start_matches("Digest ")
        .split(',')
        .filter_map(|param| param.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

/// Registrar holding a single account
struct Registrar {
    password: &'static str,
    nonce: String,
    expires: u32,
    /// CSeq numbers of the REGISTERs seen, in order
    sequence: Vec<u32>,
}

impl Registrar {
    fn new(password: &'static str, expires: u32) -> Self {
        Self {
            password,
            nonce: "nonce-1".to_string(),
            expires,
            sequence: Vec::new(),
        }
    }

    fn authorized(&self, request: &SipMessage) -> bool {
        let header = request.header_field("Authorization");
        if header.is_empty() {
            return false;
        }
        let params = digest_params(&header);
        let (Some(username), Some(uri), Some(nonce), Some(response)) = (
            params.get("username"),
            params.get("uri"),
            params.get("nonce"),
            params.get("response"),
        ) else {
            return false;
        };
        if *nonce != self.nonce {
            return false;
        }
        let ha1 = md5_hex(format!("{}:{}:{}", username, REALM, self.password));
        let ha2 = md5_hex(format!("{}:{}", request.method(), uri));
        *response == md5_hex(format!("{}:{}:{}", ha1, nonce, ha2))
    }

    fn respond(&mut self, request: &SipMessage) -> SipMessage {
        assert_eq!(request.method(), "REGISTER");
        self.sequence.push(request.sequence_number());

        let mut response = if self.authorized(request) {
            let mut ok = SipMessage::new_response(200, "OK");
            let contact = request.header_field("Contact");
            let expires = if contact.ends_with(";expires=0") { 0 } else { self.expires };
            ok.set_header_field(
                "Contact",
                format!("{};expires={}", contact.trim_end_matches(";expires=0"), expires),
            );
            ok
        } else {
            let mut challenge = SipMessage::new_response(401, "Unauthorized");
            challenge.set_header_field(
                "WWW-Authenticate",
                format!("Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5", REALM, self.nonce),
            );
            challenge
        };
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            response.set_header_field(name, request.header_field(name));
        }
        response
    }

    /// Answer everything the client has queued
    fn serve(&mut self, client: &mut SipClient, now: Instant) {
        let server: SocketAddr = SERVER.parse().unwrap();
        while let Some((dest, data)) = client.poll_transmit() {
            assert_eq!(dest, server);
            let response = self.respond(&SipMessage::parse(&data));
            client.handle_datagram(&response.to_bytes(), server, now);
        }
    }
}

fn client(password: &str) -> SipClient {
    let mut config = PhoneConfig::default();
    config.account.domain = "example.com".to_string();
    config.account.username = "alice".to_string();
    config.account.password = password.to_string();
    config.network.bind_address = "10.0.0.1:5060".parse().unwrap();
    let mut client = SipClient::new(&config, Arc::new(NullAudioDevices::default()));
    client.set_local_address(config.network.bind_address);
    client
}

fn start(client: &mut SipClient, now: Instant) {
    client.connect_to_server(now);
    assert_eq!(
        client.poll_action(),
        Some(ClientAction::Resolve { domain: "example.com".to_string() })
    );
    client.set_sip_server(SERVER.parse().unwrap(), now);
    client.set_stun_server(None, now);
}

#[test]
fn test_digest_registration_renews_and_unregisters() {
    let now = Instant::now();
    let mut registrar = Registrar::new("secret", 60);
    let mut client = client("secret");

    start(&mut client, now);
    registrar.serve(&mut client, now);
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(registrar.sequence, [1, 2]);

    let events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
    assert_eq!(
        events.iter().filter(|e| **e == ClientEvent::Connected).count(),
        1
    );

    // renewal reuses the cached challenge
    let renew_at = now + Duration::from_secs(50);
    assert_eq!(client.poll_timeout(), Some(renew_at));
    client.handle_timeout(renew_at);
    registrar.serve(&mut client, renew_at);
    assert_eq!(registrar.sequence, [1, 2, 3]);
    assert_eq!(client.state(), ClientState::Connected);

    // a new nonce is answered with a single retry
    registrar.nonce = "nonce-2".to_string();
    let renew_at = renew_at + Duration::from_secs(50);
    client.handle_timeout(renew_at);
    registrar.serve(&mut client, renew_at);
    assert_eq!(registrar.sequence, [1, 2, 3, 4, 5]);
    assert_eq!(client.state(), ClientState::Connected);

    client.disconnect_from_server(renew_at);
    assert_eq!(client.state(), ClientState::Disconnecting);
    registrar.serve(&mut client, renew_at);
    assert_eq!(registrar.sequence, [1, 2, 3, 4, 5, 6]);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.poll_timeout(), None);
}

#[test]
fn test_rejected_credentials_retry_later() {
    let now = Instant::now();
    let mut registrar = Registrar::new("secret", 60);
    let mut client = client("wrong");

    start(&mut client, now);
    registrar.serve(&mut client, now);
    assert_eq!(registrar.sequence, [1, 2]);
    assert_eq!(client.state(), ClientState::Disconnected);

    let retry_at = now + Duration::from_secs(60);
    assert_eq!(client.poll_timeout(), Some(retry_at));
    client.handle_timeout(retry_at);
    assert_eq!(client.state(), ClientState::Connecting);
    assert_eq!(
        client.poll_action(),
        Some(ClientAction::Resolve { domain: "example.com".to_string() })
    );
}
