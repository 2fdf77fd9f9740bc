//! Dialog context shared by the registration and by every call
//!
//! Holds the Call-ID, local tag, CSeq counter and the last digest
//! challenges received for this Call-ID.

use super::auth::AuthChallenge;
use super::message::SipMessage;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

/// Random alphanumeric token
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct SipCallContext {
    cseq: u32,
    id: String,
    tag: String,
    challenge: Option<AuthChallenge>,
    proxy_challenge: Option<AuthChallenge>,
}

impl Default for SipCallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SipCallContext {
    /// Create a context with a fresh Call-ID and tag
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string())
    }

    /// Create a context for an existing Call-ID (incoming calls)
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            cseq: 1,
            id: id.into(),
            tag: random_token(8),
            challenge: None,
            proxy_challenge: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    /// CSeq number the next request will use
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Take a CSeq number for a new request
    pub fn next_cseq(&mut self) -> u32 {
        let seq = self.cseq;
        self.cseq += 1;
        seq
    }

    /// Cached WWW-Authenticate challenge
    pub fn challenge(&self) -> Option<&AuthChallenge> {
        self.challenge.as_ref()
    }

    /// Cached Proxy-Authenticate challenge
    pub fn proxy_challenge(&self) -> Option<&AuthChallenge> {
        self.proxy_challenge.as_ref()
    }

    pub fn clear_challenges(&mut self) {
        self.challenge = None;
        self.proxy_challenge = None;
    }

    /// Store the challenge carried by a 401/407 reply.
    ///
    /// Returns `false` if the reply carries no usable challenge or the same
    /// realm and nonce as the cached one, meaning our credentials were
    /// rejected and the request must not be retried.
    pub fn handle_authentication(&mut self, reply: &SipMessage) -> bool {
        let (header, slot) = if reply.status_code() == 407 {
            ("Proxy-Authenticate", &mut self.proxy_challenge)
        } else {
            ("WWW-Authenticate", &mut self.challenge)
        };

        let challenge = match AuthChallenge::parse(&reply.header_field(header)) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("Call {}: {}", self.id, e);
                return false;
            }
        };

        if slot.as_ref().is_some_and(|cached| cached.is_same_as(&challenge)) {
            warn!("Call {}: Authentication failed", self.id);
            return false;
        }

        *slot = Some(challenge);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_reply(code: u16, nonce: &str) -> SipMessage {
        let mut reply = SipMessage::new_response(code, "Unauthorized");
        let header = if code == 407 {
            "Proxy-Authenticate"
        } else {
            "WWW-Authenticate"
        };
        reply.set_header_field(
            header,
            format!(r#"Digest realm="example.com", nonce="{}""#, nonce),
        );
        reply
    }

    #[test]
    fn test_new_context() {
        let ctx = SipCallContext::new();

        assert_eq!(ctx.cseq(), 1);
        assert_eq!(ctx.tag().len(), 8);
        assert!(!ctx.id().is_empty());
        assert_ne!(ctx.id(), SipCallContext::new().id());
    }

    #[test]
    fn test_cseq_increments() {
        let mut ctx = SipCallContext::new();

        assert_eq!(ctx.next_cseq(), 1);
        assert_eq!(ctx.next_cseq(), 2);
        assert_eq!(ctx.cseq(), 3);
    }

    #[test]
    fn test_fresh_challenge_accepted() {
        let mut ctx = SipCallContext::new();

        assert!(ctx.handle_authentication(&challenge_reply(401, "n1")));
        assert_eq!(ctx.challenge().map(|c| c.nonce.as_str()), Some("n1"));
        assert!(ctx.proxy_challenge().is_none());

        assert!(ctx.handle_authentication(&challenge_reply(401, "n2")));
        assert_eq!(ctx.challenge().map(|c| c.nonce.as_str()), Some("n2"));
    }

    #[test]
    fn test_repeated_challenge_rejected() {
        let mut ctx = SipCallContext::new();

        assert!(ctx.handle_authentication(&challenge_reply(407, "n1")));
        assert!(!ctx.handle_authentication(&challenge_reply(407, "n1")));
        assert!(ctx.proxy_challenge().is_some());
    }

    #[test]
    fn test_missing_challenge_rejected() {
        let mut ctx = SipCallContext::new();
        let reply = SipMessage::new_response(401, "Unauthorized");

        assert!(!ctx.handle_authentication(&reply));
    }

    #[test]
    fn test_clear_challenges() {
        let mut ctx = SipCallContext::new();
        ctx.handle_authentication(&challenge_reply(401, "n1"));
        ctx.handle_authentication(&challenge_reply(407, "n1"));
        ctx.clear_challenges();

        assert!(ctx.challenge().is_none());
        assert!(ctx.proxy_challenge().is_none());
    }
}
