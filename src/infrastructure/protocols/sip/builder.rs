//! SIP request/response builders for the local user agent

use super::auth::{authorization, UserCredentials};
use super::context::{random_token, SipCallContext};
use super::message::{SipMessage, SipMethod};
use std::net::SocketAddr;

const ALLOW: &str = "INVITE, ACK, CANCEL, OPTIONS, BYE";

/// Generate a new RFC 3261 branch
pub fn new_branch() -> String {
    format!("z9hG4bK-{}", random_token(16))
}

/// Identity and local transport address of the user agent
#[derive(Debug, Clone)]
pub struct UserAgent {
    pub domain: String,
    pub username: String,
    pub display_name: String,
    pub credentials: UserCredentials,
    pub user_agent: String,
    /// Address advertised in Via and Contact
    pub local_addr: SocketAddr,
}

impl UserAgent {
    /// `sip:<domain>`, the REGISTER request URI
    pub fn server_uri(&self) -> String {
        format!("sip:{}", self.domain)
    }

    /// Address of record, `sip:<user>@<domain>`
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Name-addr used in From and To
    pub fn address(&self) -> String {
        if self.display_name.is_empty() {
            format!("<{}>", self.uri())
        } else {
            format!("\"{}\" <{}>", self.display_name, self.uri())
        }
    }

    pub fn contact_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.local_addr)
    }

    /// Reset the Contact header to our current local address
    pub fn set_contact(&self, message: &mut SipMessage) {
        message.set_header_field("Contact", format!("<{}>", self.contact_uri()));
    }

    /// Attach Authorization / Proxy-Authorization for the cached challenges
    fn set_authorization(&self, request: &mut SipMessage, ctx: &SipCallContext) {
        if let Some(challenge) = ctx.challenge() {
            let value = authorization(request.method(), request.uri(), challenge, &self.credentials);
            request.set_header_field("Authorization", value);
        }
        if let Some(challenge) = ctx.proxy_challenge() {
            let value = authorization(request.method(), request.uri(), challenge, &self.credentials);
            request.set_header_field("Proxy-Authorization", value);
        }
    }

    /// Build a request on the dialog described by `ctx`.
    ///
    /// To is set to our own address; callers override it for calls.
    pub fn build_request(
        &self,
        method: SipMethod,
        uri: &str,
        ctx: &SipCallContext,
        seq: u32,
    ) -> SipMessage {
        let mut request = SipMessage::new_request(method, uri);
        request.set_header_field(
            "Via",
            format!("SIP/2.0/UDP {};branch={};rport", self.local_addr, new_branch()),
        );
        request.set_header_field("Max-Forwards", "70");
        request.set_header_field("Call-ID", ctx.id());
        request.set_header_field("CSeq", format!("{} {}", seq, method));
        self.set_contact(&mut request);
        request.set_header_field("To", self.address());
        request.set_header_field("From", format!("{};tag={}", self.address(), ctx.tag()));

        self.set_authorization(&mut request, ctx);

        request.set_header_field("User-Agent", self.user_agent.as_str());
        if !matches!(method, SipMethod::Ack | SipMethod::Cancel) {
            request.set_header_field("Allow", ALLOW);
        }
        request
    }

    /// Build a response to `request`, copying the dialog headers
    pub fn build_response(&self, request: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::new_response(code, reason);
        for via in request.header_field_values("Via") {
            response.add_header_field("Via", via);
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            response.set_header_field(name, request.header_field(name));
        }
        for route in request.header_field_values("Record-Route") {
            response.add_header_field("Record-Route", route);
        }
        self.set_contact(&mut response);
        response.set_header_field("User-Agent", self.user_agent.as_str());
        response
    }

    /// Re-issue `original` after an authentication challenge.
    ///
    /// The retry takes a new CSeq from `ctx`, recomputes the credentials and
    /// opens a new transaction (fresh Via branch). Contact points at the
    /// current local address but keeps the original's parameters, so an
    /// un-REGISTER stays `;expires=0`.
    pub fn build_retry(&self, original: &SipMessage, ctx: &mut SipCallContext) -> SipMessage {
        let mut request = original.clone();
        request.set_header_field(
            "CSeq",
            format!("{} {}", ctx.next_cseq(), request.method()),
        );
        request.set_header_field(
            "Via",
            format!("SIP/2.0/UDP {};branch={};rport", self.local_addr, new_branch()),
        );
        self.set_authorization(&mut request, ctx);
        let params = original
            .header_field("Contact")
            .split_once('>')
            .map(|(_, params)| params.to_string())
            .unwrap_or_default();
        request.set_header_field("Contact", format!("<{}>{}", self.contact_uri(), params));
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn user_agent() -> UserAgent {
        UserAgent {
            domain: "example.com".to_string(),
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            credentials: UserCredentials {
                username: "alice".to_string(),
                password: "secret".to_string(),
            },
            user_agent: "yakphone/test".to_string(),
            local_addr: "192.168.1.10:5070".parse().unwrap(),
        }
    }

    #[test]
    fn test_address() {
        let mut ua = user_agent();
        assert_eq!(ua.address(), "\"Alice\" <sip:alice@example.com>");

        ua.display_name.clear();
        assert_eq!(ua.address(), "<sip:alice@example.com>");
    }

    #[test]
    fn test_build_request() {
        let ua = user_agent();
        let ctx = SipCallContext::new();
        let request = ua.build_request(SipMethod::Invite, "sip:bob@example.com", &ctx, 7);

        assert!(request.is_request());
        assert_eq!(request.method(), "INVITE");
        assert_eq!(request.uri(), "sip:bob@example.com");
        assert_eq!(request.header_field("CSeq"), "7 INVITE");
        assert_eq!(request.header_field("Call-ID"), ctx.id());
        assert_eq!(request.header_field("Max-Forwards"), "70");
        assert_eq!(request.header_field("Contact"), "<sip:alice@192.168.1.10:5070>");
        assert_eq!(
            request.header_field("From"),
            format!("\"Alice\" <sip:alice@example.com>;tag={}", ctx.tag())
        );
        assert_eq!(request.header_field("Allow"), ALLOW);
        assert!(request.header_field("Via").starts_with("SIP/2.0/UDP 192.168.1.10:5070;branch=z9hG4bK-"));
        assert!(request.header_field("Via").ends_with(";rport"));
        assert!(!request.has_header_field("Authorization"));
    }

    #[test]
    fn test_build_request_branches_differ() {
        let ua = user_agent();
        let ctx = SipCallContext::new();
        let first = ua.build_request(SipMethod::Register, "sip:example.com", &ctx, 1);
        let second = ua.build_request(SipMethod::Register, "sip:example.com", &ctx, 2);

        assert_ne!(first.branch(), second.branch());
    }

    #[test]
    fn test_ack_and_cancel_have_no_allow() {
        let ua = user_agent();
        let ctx = SipCallContext::new();

        for method in [SipMethod::Ack, SipMethod::Cancel] {
            let request = ua.build_request(method, "sip:bob@example.com", &ctx, 1);
            assert!(!request.has_header_field("Allow"));
        }
    }

    #[test]
    fn test_build_request_with_cached_challenge() {
        let ua = user_agent();
        let mut ctx = SipCallContext::new();
        let mut reply = SipMessage::new_response(401, "Unauthorized");
        reply.set_header_field("WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        assert!(ctx.handle_authentication(&reply));

        let request = ua.build_request(SipMethod::Register, "sip:example.com", &ctx, 1);
        let header = request.header_field("Authorization");
        assert!(header.starts_with("Digest username=\"alice\""));
        assert!(header.contains("uri=\"sip:example.com\""));
        assert!(!request.has_header_field("Proxy-Authorization"));
    }

    #[test]
    fn test_build_response() {
        let ua = user_agent();
        let mut request = SipMessage::new_request(SipMethod::Invite, "sip:alice@example.com");
        request.add_header_field("Via", "SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK-1");
        request.add_header_field("Via", "SIP/2.0/UDP 10.0.0.2;branch=z9hG4bK-2");
        request.set_header_field("From", "<sip:bob@example.com>;tag=b");
        request.set_header_field("To", "<sip:alice@example.com>");
        request.set_header_field("Call-ID", "call-1");
        request.set_header_field("CSeq", "3 INVITE");
        request.add_header_field("Record-Route", "<sip:proxy.example.com;lr>");

        let response = ua.build_response(&request, 180, "Ringing");

        assert!(response.is_reply());
        assert_eq!(response.status_code(), 180);
        assert_eq!(response.header_field_values("Via").len(), 2);
        assert_eq!(response.header_field("From"), "<sip:bob@example.com>;tag=b");
        assert_eq!(response.header_field("CSeq"), "3 INVITE");
        assert_eq!(response.header_field("Record-Route"), "<sip:proxy.example.com;lr>");
        assert_eq!(response.header_field("Contact"), "<sip:alice@192.168.1.10:5070>");
    }

    #[test]
    fn test_build_retry() {
        let ua = user_agent();
        let mut ctx = SipCallContext::new();
        let seq = ctx.next_cseq();
        let original = ua.build_request(SipMethod::Invite, "sip:bob@example.com", &ctx, seq);

        let mut reply = SipMessage::new_response(407, "Proxy Authentication Required");
        reply.set_header_field("Proxy-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        assert!(ctx.handle_authentication(&reply));

        let retry = ua.build_retry(&original, &mut ctx);

        assert_eq!(retry.header_field("CSeq"), "2 INVITE");
        assert_eq!(retry.header_field("Call-ID"), original.header_field("Call-ID"));
        assert_eq!(retry.header_field("From"), original.header_field("From"));
        assert_ne!(retry.branch(), original.branch());
        assert!(retry.has_header_field("Proxy-Authorization"));
        assert_eq!(retry.header_field("Contact"), "<sip:alice@192.168.1.10:5070>");
        assert_eq!(ctx.cseq(), 3);
    }

    #[test]
    fn test_build_retry_keeps_contact_parameters() {
        let mut ua = user_agent();
        let mut ctx = SipCallContext::new();
        let seq = ctx.next_cseq();
        let mut original = ua.build_request(SipMethod::Register, "sip:example.com", &ctx, seq);
        original.set_header_field("Contact", format!("<{}>;expires=0", ua.contact_uri()));

        let mut reply = SipMessage::new_response(401, "Unauthorized");
        reply.set_header_field("WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        assert!(ctx.handle_authentication(&reply));

        ua.local_addr = "203.0.113.7:40000".parse().unwrap();
        let retry = ua.build_retry(&original, &mut ctx);
        assert_eq!(retry.header_field("Contact"), "<sip:alice@203.0.113.7:40000>;expires=0");
        assert!(retry.has_header_field("Authorization"));
    }
}
