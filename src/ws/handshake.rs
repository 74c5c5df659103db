//! WebSocket upgrade handshake (RFC 6455 §4).
//!
//! Covers both directions of the HTTP upgrade:
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use super::{GUID, VERSION};
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

pub use crate::http::HttpHead;

/// Computes the `Sec-WebSocket-Accept` proof for a client key:
/// `base64(SHA1(key ++ GUID))`.
///
/// ```
/// use evio::ws::compute_accept_key;
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generates a fresh client key: 16 random bytes, base64-encoded.
#[must_use]
pub fn generate_client_key() -> String {
    let mut key = [0u8; 16];
    getrandom::getrandom(&mut key).expect("OS RNG unavailable");
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// True if the comma-separated header `value` contains `token`,
/// case-insensitively. Used for `Connection: keep-alive, Upgrade` and
/// `Sec-WebSocket-Version` lists.
#[must_use]
pub fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Handshake-level failures.
#[derive(Debug)]
pub enum HandshakeError {
    /// URL could not be parsed as `ws://` / `wss://`.
    InvalidUrl(String),
    /// Request or response head was malformed.
    Malformed(String),
    /// A mandatory header is absent.
    MissingHeader(&'static str),
    /// The client key is not 16 base64 bytes.
    InvalidKey,
    /// The server's accept proof does not match the key we sent.
    AcceptMismatch {
        /// Proof we computed from our key.
        expected: String,
        /// Proof the server presented.
        actual: String,
    },
    /// Version list does not include 13.
    UnsupportedVersion(String),
    /// Response status was not 101.
    NotSwitching(u16),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(msg) => write!(f, "invalid WebSocket URL: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed upgrade message: {msg}"),
            Self::MissingHeader(name) => write!(f, "missing header {name}"),
            Self::InvalidKey => write!(f, "Sec-WebSocket-Key is not 16 base64 bytes"),
            Self::AcceptMismatch { expected, actual } => {
                write!(f, "Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported WebSocket version {v}"),
            Self::NotSwitching(status) => write!(f, "expected 101, got {status}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// A parsed `ws://` / `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host name or address.
    pub host: String,
    /// Port, defaulted per scheme (80 / 443).
    pub port: u16,
    /// Path plus query, at least `/`.
    pub path: String,
    /// True for `wss://`.
    pub tls: bool,
}

impl WsUrl {
    /// Parses `ws://host[:port]/path?query` or the `wss` variant.
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| HandshakeError::InvalidUrl("missing scheme".into()))?;
        let tls = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(HandshakeError::InvalidUrl(format!("scheme {other:?}")));
            }
        };
        let default_port = if tls { 443 } else { 80 };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(end) = authority.find(']') {
            // Bracketed IPv6 literal.
            if !authority.starts_with('[') {
                return Err(HandshakeError::InvalidUrl("bad IPv6 literal".into()));
            }
            let host = &authority[1..end];
            let port = match authority[end + 1..].strip_prefix(':') {
                Some(port) => port
                    .parse()
                    .map_err(|_| HandshakeError::InvalidUrl("bad port".into()))?,
                None => default_port,
            };
            (host.to_owned(), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            let port = port
                .parse()
                .map_err(|_| HandshakeError::InvalidUrl("bad port".into()))?;
            (host.to_owned(), port)
        } else {
            (authority.to_owned(), default_port)
        };

        if host.is_empty() {
            return Err(HandshakeError::InvalidUrl("empty host".into()));
        }
        Ok(Self {
            host,
            port,
            path: path.to_owned(),
            tls,
        })
    }

    /// The `Host` header value: port omitted when it is the scheme default.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The equivalent `http`/`https` request URL, as sent on the wire.
    #[must_use]
    pub fn http_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}{}", self.host_header(), self.path)
    }
}

/// Validated upgrade request as seen by the server side.
///
/// Handed to the handshake callback so policy (origin checks, subprotocol
/// selection) lives with the application.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request path including any query.
    pub path: String,
    /// `Origin` header, if the client sent one.
    pub origin: Option<String>,
    /// Client's `Sec-WebSocket-Key`.
    pub key: String,
    /// Subprotocols offered by the client, in offer order.
    pub protocols: Vec<String>,
    /// Extensions offered by the client.
    pub extensions: Vec<String>,
}

impl UpgradeRequest {
    /// Validates the request head per RFC 6455 §4.2.1.
    pub fn from_head(head: &HttpHead) -> Result<Self, HandshakeError> {
        let (method, path) = head
            .request_line()
            .ok_or_else(|| HandshakeError::Malformed("not a request".into()))?;
        if !method.eq_ignore_ascii_case("GET") {
            return Err(HandshakeError::Malformed(format!("method {method}")));
        }
        let upgrade = head
            .header("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::Malformed(format!("Upgrade: {upgrade}")));
        }
        let connection = head
            .header("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !contains_token(connection, "Upgrade") {
            return Err(HandshakeError::Malformed(format!(
                "Connection: {connection}"
            )));
        }
        let version = head
            .header("sec-websocket-version")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
        // The version header is a token list; 13 anywhere in it is fine.
        if !contains_token(version, VERSION) {
            return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
        }
        let key = head
            .header("sec-websocket-key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        match base64::engine::general_purpose::STANDARD.decode(key) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        let list = |name: &str| -> Vec<String> {
            head.header_values(name)
                .flat_map(|v| v.split(','))
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Ok(Self {
            path: path.to_owned(),
            origin: head.header("origin").map(str::to_owned),
            key: key.to_owned(),
            protocols: list("sec-websocket-protocol"),
            extensions: list("sec-websocket-extensions"),
        })
    }
}

/// Client-side handshake state: the key sent, for validating the proof.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
}

impl ClientHandshake {
    /// Creates a handshake with a fresh random key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: generate_client_key(),
        }
    }

    /// Creates a handshake with a caller-chosen key (tests only; real
    /// connections need fresh entropy per RFC 6455 §4.1).
    #[must_use]
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The key to send as `Sec-WebSocket-Key`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Validates the server's 101 response per RFC 6455 §4.2.2.
    pub fn validate_response(&self, head: &HttpHead) -> Result<(), HandshakeError> {
        let status = head
            .status()
            .ok_or_else(|| HandshakeError::Malformed("not a response".into()))?;
        if status != 101 {
            return Err(HandshakeError::NotSwitching(status));
        }
        let upgrade = head
            .header("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::Malformed(format!("Upgrade: {upgrade}")));
        }
        let connection = head
            .header("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !contains_token(connection, "Upgrade") {
            return Err(HandshakeError::Malformed(format!(
                "Connection: {connection}"
            )));
        }
        let actual = head
            .header("sec-websocket-accept")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        let expected = compute_accept_key(&self.key);
        if actual != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: actual.to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    #[test]
    fn rfc6455_accept_example() {
        assert_eq!(compute_accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn generated_keys_are_sixteen_bytes() {
        let key = generate_client_key();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn token_matching_is_case_insensitive() {
        assert!(contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(contains_token("UPGRADE", "Upgrade"));
        assert!(!contains_token("keep-alive", "upgrade"));
        assert!(contains_token("8, 13", "13"));
    }

    #[test]
    fn url_parsing() {
        let url = WsUrl::parse("ws://example.com/chat").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/chat");
        assert!(!url.tls);

        let url = WsUrl::parse("wss://example.com:8443/ws?room=1").unwrap();
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/ws?room=1");
        assert!(url.tls);

        let url = WsUrl::parse("ws://localhost:9000").unwrap();
        assert_eq!(url.path, "/");

        let url = WsUrl::parse("ws://[::1]:8080/t").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 8080);

        assert!(WsUrl::parse("http://example.com/").is_err());
        assert!(WsUrl::parse("no-scheme").is_err());
    }

    #[test]
    fn host_header_elides_default_port() {
        assert_eq!(
            WsUrl::parse("ws://h/").unwrap().host_header(),
            "h"
        );
        assert_eq!(
            WsUrl::parse("ws://h:8080/").unwrap().host_header(),
            "h:8080"
        );
        assert_eq!(
            WsUrl::parse("wss://h:443/").unwrap().host_header(),
            "h"
        );
    }

    #[test]
    fn http_url_maps_scheme() {
        assert_eq!(
            WsUrl::parse("ws://h:81/p?q=1").unwrap().http_url(),
            "http://h:81/p?q=1"
        );
        assert_eq!(
            WsUrl::parse("wss://h/p").unwrap().http_url(),
            "https://h/p"
        );
    }

    fn sample_request_head() -> HttpHead {
        HttpHead::parse(
            b"GET /chat HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Origin: http://example.com\r\n\
              Sec-WebSocket-Protocol: chat, superchat\r\n\
              Sec-WebSocket-Version: 13\r\n",
        )
        .unwrap()
    }

    #[test]
    fn upgrade_request_validation() {
        let request = UpgradeRequest::from_head(&sample_request_head()).unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(request.key, SAMPLE_KEY);
        assert_eq!(request.origin.as_deref(), Some("http://example.com"));
        assert_eq!(request.protocols, vec!["chat", "superchat"]);
        assert!(request.extensions.is_empty());
    }

    #[test]
    fn upgrade_request_rejects_bad_version() {
        let head = HttpHead::parse(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 8\r\n",
        )
        .unwrap();
        assert!(matches!(
            UpgradeRequest::from_head(&head),
            Err(HandshakeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn upgrade_request_accepts_version_list() {
        let head = HttpHead::parse(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 8, 13\r\n",
        )
        .unwrap();
        assert!(UpgradeRequest::from_head(&head).is_ok());
    }

    #[test]
    fn upgrade_request_rejects_bad_key() {
        let head = HttpHead::parse(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: c2hvcnQ=\r\n\
              Sec-WebSocket-Version: 13\r\n",
        )
        .unwrap();
        assert!(matches!(
            UpgradeRequest::from_head(&head),
            Err(HandshakeError::InvalidKey)
        ));
    }

    #[test]
    fn client_validates_accept_proof() {
        let handshake = ClientHandshake::with_key(SAMPLE_KEY);
        let head = HttpHead::parse(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: keep-alive, Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n",
        )
        .unwrap();
        handshake.validate_response(&head).unwrap();
    }

    #[test]
    fn client_rejects_wrong_accept() {
        let handshake = ClientHandshake::with_key(SAMPLE_KEY);
        let head = HttpHead::parse(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: bm90LXRoZS1yaWdodC1wcm9vZg==\r\n",
        )
        .unwrap();
        assert!(matches!(
            handshake.validate_response(&head),
            Err(HandshakeError::AcceptMismatch { .. })
        ));
    }

    #[test]
    fn client_rejects_non_101() {
        let handshake = ClientHandshake::with_key(SAMPLE_KEY);
        let head = HttpHead::parse(b"HTTP/1.1 403 Forbidden\r\n").unwrap();
        assert!(matches!(
            handshake.validate_response(&head),
            Err(HandshakeError::NotSwitching(403))
        ));
    }
}
