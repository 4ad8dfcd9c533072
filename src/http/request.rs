//! Request head parsing and accessors.

use crate::http::params;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Maximum number of header fields in one request.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

/// Why a request head was rejected. All variants map to 400.
#[derive(Debug)]
pub enum ParseError {
    Malformed(httparse::Error),
    Incomplete,
    InvalidContentLength,
    NonUtf8Header,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(e) => write!(f, "malformed request head: {e}"),
            ParseError::Incomplete => write!(f, "incomplete request head"),
            ParseError::InvalidContentLength => write!(f, "invalid Content-Length"),
            ParseError::NonUtf8Header => write!(f, "header value is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Locate the end of a request head in `buf`, scanning from `from`.
///
/// Accepts both `\r\n\r\n` and bare `\n\n`. Returns the offset just past
/// the blank line.
pub fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match &buf[i + 1..] {
                [b'\n', ..] => return Some(i + 2),
                [b'\r', b'\n', ..] => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// One HTTP request.
#[derive(Debug, Default)]
pub struct Request {
    head: Bytes,
    method: String,
    uri: String,
    version: Version,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    chunked: bool,
    expect_continue: bool,
    keep_alive: bool,
    pub(crate) body: Bytes,
    path_info_offset: usize,
    params: Option<Vec<(String, String)>>,
    cookies: Option<Vec<(String, String)>>,
    remote_addr: Option<SocketAddr>,
    pub(crate) shutting_down: bool,
}

impl Request {
    /// Parse a complete request head (terminating blank line included).
    pub fn parse(head: Bytes, remote_addr: Option<SocketAddr>) -> Result<Request, ParseError> {
        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut fields);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
            Err(e) => return Err(ParseError::Malformed(e)),
        }

        let version = match parsed.version {
            Some(0) => Version::Http10,
            _ => Version::Http11,
        };
        let method = parsed.method.unwrap_or_default().to_string();
        let uri = parsed.path.unwrap_or_default().to_string();

        let mut headers = Vec::with_capacity(parsed.headers.len());
        for field in parsed.headers.iter() {
            let value = std::str::from_utf8(field.value).map_err(|_| ParseError::NonUtf8Header)?;
            headers.push((field.name.to_string(), value.trim().to_string()));
        }

        let mut request = Request {
            head: Bytes::new(),
            method,
            uri,
            version,
            headers,
            remote_addr,
            ..Default::default()
        };

        request.chunked = request
            .header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if !request.chunked {
            let mut declared: Option<u64> = None;
            for (name, value) in &request.headers {
                if !name.eq_ignore_ascii_case("Content-Length") {
                    continue;
                }
                let len = value
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidContentLength)?;
                if declared.map_or(false, |d| d != len) {
                    return Err(ParseError::InvalidContentLength);
                }
                declared = Some(len);
            }
            request.content_length = declared;
        }

        request.expect_continue = request
            .header("Expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);

        let connection = request.header("Connection").map(|v| v.to_ascii_lowercase());
        request.keep_alive = match (version, connection.as_deref()) {
            (_, Some(c)) if c.contains("close") => false,
            (Version::Http10, Some(c)) => c.contains("keep-alive"),
            (Version::Http10, None) => false,
            (Version::Http11, _) => true,
        };

        request.head = head;
        Ok(request)
    }

    /// Raw head bytes as received.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// URI without the query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(&self.uri, |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    /// Remainder of the URI after the prefix of the matched handler.
    pub fn path_info(&self) -> &str {
        self.uri.get(self.path_info_offset..).unwrap_or("")
    }

    pub(crate) fn set_path_info_offset(&mut self, offset: usize) {
        self.path_info_offset = offset.min(self.uri.len());
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// First header with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// A body follows the head.
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.map_or(false, |len| len > 0)
    }

    pub fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    /// Whether the client asked for a persistent connection.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The server has started shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Parse query string and url-encoded form body into parameters.
    ///
    /// Idempotent. Called by the dispatcher for handlers that ask for it.
    pub fn parse_parameters(&mut self) {
        if self.params.is_some() {
            return;
        }
        let mut params = self.query().map(params::parse_query).unwrap_or_default();
        let is_form = self
            .content_type()
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            params.extend(params::parse_query(&String::from_utf8_lossy(&self.body)));
        }
        self.params = Some(params);
    }

    pub fn parse_cookies(&mut self) {
        if self.cookies.is_some() {
            return;
        }
        let cookies = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("Cookie"))
            .flat_map(|(_, v)| params::parse_cookies(v))
            .collect();
        self.cookies = Some(cookies);
    }

    /// Parameter `name`, if parameters were parsed.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .as_ref()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        self.params.as_deref().unwrap_or(&[])
    }

    /// Cookie `name`, if cookies were parsed.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .as_ref()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
