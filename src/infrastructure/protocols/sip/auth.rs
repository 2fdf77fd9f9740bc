//! SIP Digest Authentication (RFC 2617, RFC 3261) - client side

use super::message::SipError;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Account credentials used to answer challenges
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// Digest challenge received in a WWW-Authenticate or Proxy-Authenticate header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    /// Parse a `Digest realm="...", nonce="..."` header value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let digest = value
            .trim()
            .strip_prefix("Digest ")
            .ok_or_else(|| SipError::Authentication("Unsupported authentication method".to_string()))?;

        let mut params = parse_digest_params(digest);
        let realm = params
            .remove("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .remove("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            realm,
            nonce,
            algorithm: params.remove("algorithm"),
            qop: params.remove("qop"),
            opaque: params.remove("opaque"),
        })
    }

    /// Same realm and nonce, i.e. the server rejected our answer to it
    pub fn is_same_as(&self, other: &AuthChallenge) -> bool {
        self.realm == other.realm && self.nonce == other.nonce
    }
}

/// Parse comma separated `key="value"` pairs
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in super::message::split_unquoted(value, ',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    params
}

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input))
}

/// Compute the digest response
///
/// With `qop` the response is `MD5(HA1:nonce:nc:cnonce:qop:HA2)`, otherwise
/// `MD5(HA1:nonce:HA2)`.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = md5_hex(format!("{}:{}:{}", username, realm, password));
    // HA2 = MD5(method:uri)
    let ha2 = md5_hex(format!("{}:{}", method, uri));

    match qop {
        Some((qop, nc, cnonce)) => md5_hex(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Build an Authorization / Proxy-Authorization header value answering `challenge`
pub fn authorization(
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
    credentials: &UserCredentials,
) -> String {
    let cnonce = {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        hex::encode(bytes)
    };
    let nc = "00000001";
    // only "auth" is supported; a server may offer "auth,auth-int"
    let qop = challenge.qop.as_ref().map(|_| "auth");

    let response = digest_response(
        &credentials.username,
        &credentials.password,
        &challenge.realm,
        &challenge.nonce,
        method,
        uri,
        qop.map(|q| (q, nc, cnonce.as_str())),
    );

    let quote = |value: &str| format!("\"{}\"", value);
    let mut fields = vec![
        ("username", quote(&credentials.username)),
        ("realm", quote(&challenge.realm)),
        ("nonce", quote(&challenge.nonce)),
        ("uri", quote(uri)),
        ("response", quote(&response)),
    ];
    if let Some(qop) = qop {
        // qop and nc are tokens, not quoted strings
        fields.push(("qop", qop.to_string()));
        fields.push(("cnonce", quote(&cnonce)));
        fields.push(("nc", nc.to_string()));
    }
    fields.push(("algorithm", "MD5".to_string()));
    if let Some(opaque) = &challenge.opaque {
        fields.push(("opaque", quote(opaque)));
    }

    debug!("Answering digest challenge for realm {}", challenge.realm);

    let params: Vec<String> = fields
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("Digest {}", params.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="example.com", nonce="abc123", qop="auth", opaque="xyz", algorithm=MD5"#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
    }

    #[test]
    fn test_parse_challenge_requires_digest() {
        assert!(AuthChallenge::parse(r#"Basic realm="example.com""#).is_err());
        assert!(AuthChallenge::parse(r#"Digest realm="example.com""#).is_err());
    }

    #[test]
    fn test_digest_response_rfc2617_vector() {
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(("auth", "00000001", "0a4f113b")),
        );

        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_authorization_header() {
        let challenge = AuthChallenge::parse(r#"Digest realm="example.com", nonce="n1""#).unwrap();
        let credentials = UserCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let header = authorization("REGISTER", "sip:example.com", &challenge, &credentials);

        let expected = digest_response(
            "alice",
            "secret",
            "example.com",
            "n1",
            "REGISTER",
            "sip:example.com",
            None,
        );
        assert!(header.starts_with("Digest username=\"alice\""));
        assert!(header.contains(&format!("response=\"{}\"", expected)));
        assert!(header.contains("algorithm=MD5"));
        assert!(!header.contains("cnonce"));
    }

    #[test]
    fn test_authorization_with_qop() {
        let challenge =
            AuthChallenge::parse(r#"Digest realm="example.com", nonce="n1", qop="auth,auth-int""#)
                .unwrap();
        let credentials = UserCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let header = authorization("INVITE", "sip:bob@example.com", &challenge, &credentials);

        assert!(header.contains("qop=auth,"));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("cnonce=\""));
    }
}
