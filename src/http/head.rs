//! HTTP/1.1 message-head parsing.

use std::fmt;

/// Head-parsing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadError(pub(crate) String);

impl fmt::Display for HeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message head: {}", self.0)
    }
}

impl std::error::Error for HeadError {}

/// A parsed HTTP/1.1 message head: start line plus headers.
///
/// Header names are matched case-insensitively; insertion order is kept so
/// repeated headers (`Sec-WebSocket-Protocol` may appear more than once)
/// can be collected in order.
#[derive(Debug, Clone, Default)]
pub struct HttpHead {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parses a head already known to end at a blank line.
    pub fn parse(data: &[u8]) -> Result<Self, HeadError> {
        let text =
            std::str::from_utf8(data).map_err(|_| HeadError("head is not UTF-8".into()))?;
        let mut lines = text.lines();
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HeadError("empty head".into()))?
            .to_owned();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HeadError(format!("header line {line:?}")))?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
        Ok(Self {
            start_line,
            headers,
        })
    }

    /// `(method, target)` if the start line is a request line.
    #[must_use]
    pub fn request_line(&self) -> Option<(&str, &str)> {
        let mut parts = self.start_line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        if method.chars().all(|c| c.is_ascii_alphabetic()) {
            Some((method, target))
        } else {
            None
        }
    }

    /// Status code if the start line is a response status line.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        let mut parts = self.start_line.split_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }

    /// First value of `name`, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order of appearance.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_and_response_lines() {
        let head = HttpHead::parse(
            b"GET /chat HTTP/1.1\r\n\
              Host: example.com\r\n\
              Upgrade: WebSocket\r\n",
        )
        .unwrap();
        assert_eq!(head.request_line(), Some(("GET", "/chat")));
        assert_eq!(head.status(), None);
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("UPGRADE"), Some("WebSocket"));

        let head = HttpHead::parse(b"HTTP/1.1 101 Switching Protocols\r\n").unwrap();
        assert_eq!(head.status(), Some(101));
        assert!(head.request_line().is_none());
    }

    #[test]
    fn repeated_headers_collect_in_order() {
        let head = HttpHead::parse(
            b"GET / HTTP/1.1\r\n\
              Sec-WebSocket-Protocol: chat\r\n\
              Sec-WebSocket-Protocol: superchat\r\n",
        )
        .unwrap();
        let values: Vec<_> = head.header_values("sec-websocket-protocol").collect();
        assert_eq!(values, vec!["chat", "superchat"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(HttpHead::parse(b"").is_err());
        assert!(HttpHead::parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n").is_err());
        assert!(HttpHead::parse(&[0xFF, 0xFE]).is_err());
    }
}
