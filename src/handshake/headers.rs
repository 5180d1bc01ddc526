//! HTTP request/response model for the opening handshake

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    HIXIE_REQUEST_BODY_LEN, HIXIE_RESPONSE_BODY_LEN, MAX_HEADER_SIZE, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY1, SEC_WEBSOCKET_KEY2, SEC_WEBSOCKET_LOCATION,
};
use crate::error::HandshakeError;

/// Maximum number of headers accepted in one message
const MAX_HEADERS: usize = 32;

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, keeping existing ones with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Set a header, replacing every existing one with the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in order
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Values of a repeated header joined with `", "`
    pub fn get_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    /// Whether the header is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any comma-separated token of the header equals `token`
    /// (ASCII case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Comma-separated tokens of every value of the header
    pub fn tokens<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write(&self, buf: &mut BytesMut) {
        for (name, value) in &self.entries {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    fn from_httparse(raw: &[httparse::Header<'_>]) -> Result<Self, HandshakeError> {
        let mut headers = Headers::new();
        for header in raw {
            let value = simdutf8::basic::from_utf8(header.value)
                .map_err(|_| HandshakeError::InvalidHttp("invalid header value"))?;
            headers.append(header.name, value.trim());
        }
        Ok(headers)
    }
}

/// WebSocket upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// HTTP method
    pub method: String,
    /// Request target (path and query)
    pub target: String,
    /// HTTP minor version (1 for HTTP/1.1)
    pub version: u8,
    /// Request headers
    pub headers: Headers,
    /// Body; only the hixie-76 challenge carries one
    pub body: Bytes,
}

impl HandshakeRequest {
    /// `GET target HTTP/1.1` with no headers
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            target: target.into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Path part of the target
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }

    /// Serialize as HTTP/1.1
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.target.as_bytes());
        buf.put_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        self.headers.write(&mut buf);
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    fn body_len(headers: &Headers) -> usize {
        if headers.contains(SEC_WEBSOCKET_KEY1) && headers.contains(SEC_WEBSOCKET_KEY2) {
            HIXIE_REQUEST_BODY_LEN
        } else {
            0
        }
    }
}

/// WebSocket upgrade response (or the error response that replaces it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Response headers
    pub headers: Headers,
    /// Body; the hixie-76 challenge answer, or error text
    pub body: Bytes,
}

impl HandshakeResponse {
    /// Response with the canonical reason phrase for `status`
    pub fn new(status: u16) -> Self {
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
            .to_string();
        Self {
            status,
            reason,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// `101 Switching Protocols`
    pub fn switching_protocols() -> Self {
        Self::new(101)
    }

    /// Serialize as HTTP/1.1
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.headers.write(&mut buf);
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    fn body_len(status: u16, headers: &Headers) -> usize {
        if status == 101
            && headers.contains(SEC_WEBSOCKET_LOCATION)
            && !headers.contains(SEC_WEBSOCKET_ACCEPT)
        {
            HIXIE_RESPONSE_BODY_LEN
        } else {
            0
        }
    }
}

/// Parse an upgrade request
///
/// Returns:
/// - `Ok(None)` while the header block (or a legacy challenge body) is incomplete
/// - `Ok(Some((request, consumed)))` once complete
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let headers = Headers::from_httparse(req.headers)?;
            let body_len = HandshakeRequest::body_len(&headers);
            if buf.len() < len + body_len {
                return Ok(None);
            }
            let request = HandshakeRequest {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or("/").to_string(),
                version: req.version.unwrap_or(1),
                headers,
                body: Bytes::copy_from_slice(&buf[len..len + body_len]),
            };
            Ok(Some((request, len + body_len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEADER_SIZE => {
            Err(HandshakeError::InvalidHttp("request header block too large"))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            Err(HandshakeError::InvalidHttp("too many headers"))
        }
        Err(_) => Err(HandshakeError::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Parse an upgrade response, same contract as [`parse_request`]
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = res.code.unwrap_or(0);
            let headers = Headers::from_httparse(res.headers)?;
            let body_len = HandshakeResponse::body_len(status, &headers);
            if buf.len() < len + body_len {
                return Ok(None);
            }
            let response = HandshakeResponse {
                status,
                reason: res.reason.unwrap_or_default().to_string(),
                headers,
                body: Bytes::copy_from_slice(&buf[len..len + body_len]),
            };
            Ok(Some((response, len + body_len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEADER_SIZE => {
            Err(HandshakeError::InvalidHttp("response header block too large"))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            Err(HandshakeError::InvalidHttp("too many headers"))
        }
        Err(_) => Err(HandshakeError::InvalidHttp("failed to parse HTTP response")),
    }
}
