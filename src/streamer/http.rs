//! Minimal HTTP/1.x handling
//!
//! The streamer only ever reads one request head per connection and answers
//! with an HTTP/1.0 head, so this is all the HTTP it needs.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::form_urlencoded;

use crate::config::constants::VERSION;

/// Largest request head we accept
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Value of the `Server` header
pub fn server_name() -> String {
    format!("MediaplanetHTTPServer/{}", VERSION)
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("connection closed before the request was complete")]
    Incomplete,

    #[error("request head larger than {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Request target as sent
    pub uri: String,
    /// Path part of the target, without the query
    pub path: String,
    pub version: String,
    /// Header names are lowercased
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl Request {
    /// Parse a request head (everything up to the blank line)
    pub fn parse(head: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HttpError::Malformed("request head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HttpError::Malformed("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::Malformed(format!("bad request line {:?}", request_line)));
        };
        if !version.starts_with("HTTP/") {
            return Err(HttpError::Malformed(format!("bad protocol {:?}", version)));
        }

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("bad header {:?}", line)))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (
                path,
                form_urlencoded::parse(query.as_bytes()).into_owned().collect(),
            ),
            None => (uri, Vec::new()),
        };

        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
            query,
        })
    }

    /// First value of header `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of query parameter `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Username and password from an `Authorization: Basic` header
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let value = self.header("authorization")?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }
}

/// Read one request head from `reader`
///
/// Bytes after the blank line are dropped; the streamer never reads bodies.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            return Request::parse(&buf[..end]);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HttpError::TooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HttpError::Incomplete);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reason phrase for the status codes the streamer sends
pub fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Date in the format HTTP headers use
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// An HTTP/1.0 response head, with an optional body
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// HTML error page for `code`
    pub fn error(code: u16) -> Self {
        let page = format!(
            "<!doctype html public \"-//IETF//DTD HTML 2.0//EN\">\n<html>\n<head>\n  <title>{code} {reason}</title>\n</head>\n<body>\n<h2>{code} {reason}</h2>\n</body>\n</html>\n",
            code = code,
            reason = reason(code)
        );
        Self::new(code)
            .header("Server", server_name())
            .header("Content-Type", "text/html")
            .body(page)
    }

    /// Add a header; repeated names are kept
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Encode the head, and the body unless `head_only`
    pub fn encode(&self, head_only: bool) -> Bytes {
        let mut head = String::with_capacity(256);
        let _ = write!(head, "HTTP/1.0 {} {}\r\n", self.code, reason(self.code));
        for (name, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        if !self.body.is_empty() {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        let mut out = BytesMut::from(head.as_bytes());
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out.freeze()
    }
}
