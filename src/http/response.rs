//! Response building and header serialization.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::fs::File;
use std::io::Read;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// Standard reason phrase for `code`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Response payload. Exactly one kind is active.
pub enum Body {
    Empty,
    Bytes(BytesMut),
    /// `len` bytes of `file` starting at `offset`, sent zero-copy when the
    /// socket allows it.
    File { file: File, offset: u64, len: u64 },
    /// Bytes pulled from `reader` through a fixed ring buffer. Without a
    /// known length the connection closes after the body.
    ///
    /// The reader runs on the network thread and must not block for long:
    /// in-memory data and regular files are fine, pipes and sockets are not.
    Stream {
        reader: Box<dyn Read + Send>,
        len: Option<u64>,
    },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::File { offset, len, .. } => write!(f, "File {{ offset: {offset}, len: {len} }}"),
            Body::Stream { len, .. } => write!(f, "Stream {{ len: {len:?} }}"),
        }
    }
}

/// One HTTP response.
///
/// Handlers set the status and headers and append to the body; the engine
/// serializes the head when sending starts.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: Option<String>,
    content_type: Option<String>,
    charset: Option<String>,
    headers: Vec<(String, String)>,
    keep_alive: bool,
    body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            reason: None,
            content_type: None,
            charset: None,
            headers: Vec::new(),
            keep_alive: true,
            body: Body::Empty,
        }
    }

    /// A complete error response with a small HTML page.
    pub fn error(code: u16) -> Self {
        let mut response = Self::new();
        response.send_error(code, reason_phrase(code));
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| reason_phrase(self.status))
    }

    pub fn set_status(&mut self, code: u16) -> &mut Self {
        self.status = code;
        self.reason = None;
        self
    }

    pub fn set_status_with_reason(&mut self, code: u16, reason: impl Into<String>) -> &mut Self {
        self.status = code;
        self.reason = Some(reason.into());
        self
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn set_charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.charset = Some(charset.into());
        self
    }

    /// Add an extra header. `Content-Length`, `Connection`, `Date` and
    /// `Server` are generated and should not be set here.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Append raw bytes, switching the body to in-memory if needed.
    pub fn append(&mut self, data: &[u8]) -> &mut Self {
        match &mut self.body {
            Body::Bytes(buf) => buf.extend_from_slice(data),
            _ => self.body = Body::Bytes(BytesMut::from(data)),
        }
        self
    }

    pub fn append_str(&mut self, s: &str) -> &mut Self {
        self.append(s.as_bytes())
    }

    /// Replace the body with `len` bytes of `file` from `offset`.
    pub fn send_file(&mut self, file: File, offset: u64, len: u64) -> &mut Self {
        self.body = Body::File { file, offset, len };
        self
    }

    /// Replace the body with a streamed reader.
    pub fn send_stream(&mut self, reader: Box<dyn Read + Send>, len: Option<u64>) -> &mut Self {
        self.body = Body::Stream { reader, len };
        if len.is_none() {
            self.keep_alive = false;
        }
        self
    }

    /// Replace the whole response with an HTML error page.
    pub fn send_error(&mut self, code: u16, message: &str) -> &mut Self {
        let reason = reason_phrase(code);
        self.set_status(code);
        self.headers.clear();
        self.content_type = Some("text/html".to_string());
        self.charset = Some("utf-8".to_string());
        self.body = Body::Empty;
        let page = format!(
            "<html>\n<head><title>{code} {reason}</title></head>\n\
             <body>\n<h1>{code} {reason}</h1>\n<p>{}</p>\n</body>\n</html>\n",
            escape_html(message)
        );
        self.append_str(&page)
    }

    pub fn send_redirect(&mut self, code: u16, location: &str) -> &mut Self {
        self.send_error(code, &format!("Moved to {location}"));
        self.add_header("Location", location)
    }

    /// Body length if known up front.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            Body::Empty => Some(0),
            Body::Bytes(buf) => Some(buf.len() as u64),
            Body::File { len, .. } => Some(*len),
            Body::Stream { len, .. } => *len,
        }
    }

    /// Whether the status allows a body at all.
    fn status_has_body(&self) -> bool {
        !(100..200).contains(&self.status) && self.status != 204 && self.status != 304
    }

    /// Serialize the response head. Called once, when sending starts.
    ///
    /// A body of unknown length forces the connection to close after it.
    pub(crate) fn prepare_headers(&mut self) -> Bytes {
        use fmt::Write;

        if !self.status_has_body() {
            self.body = Body::Empty;
        }
        let length = self.content_length();
        if length.is_none() {
            self.keep_alive = false;
        }

        let mut head = String::with_capacity(256);
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status, self.reason());
        let _ = write!(head, "Server: {SERVER_NAME}\r\n");
        let _ = write!(
            head,
            "Date: {}\r\n",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        );
        if let Some(content_type) = &self.content_type {
            match &self.charset {
                Some(charset) => {
                    let _ = write!(head, "Content-Type: {content_type}; charset={charset}\r\n");
                }
                None => {
                    let _ = write!(head, "Content-Type: {content_type}\r\n");
                }
            }
        }
        if let (Some(len), true) = (length, self.status_has_body()) {
            let _ = write!(head, "Content-Length: {len}\r\n");
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let _ = write!(head, "Connection: {connection}\r\n");
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }
}

/// `write!` appends formatted text to the body.
impl fmt::Write for Response {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s);
        Ok(())
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn head_text(response: &mut Response) -> String {
        String::from_utf8(response.prepare_headers().to_vec()).unwrap()
    }

    #[test]
    fn test_prepare_headers() {
        let mut response = Response::new();
        response.set_content_type("text/plain").set_charset("utf-8");
        write!(response, "hello {}", 42).unwrap();
        response.add_header("X-Trace", "abc");

        let head = head_text(&mut response);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 8\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("X-Trace: abc\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_unknown_length_stream_closes() {
        let mut response = Response::new();
        response.send_stream(Box::new(std::io::Cursor::new(b"data".to_vec())), None);
        let head = head_text(&mut response);
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!response.keep_alive());
    }

    #[test]
    fn test_error_page() {
        let mut response = Response::new();
        response.append_str("partial output");
        response.send_error(404, "no <such> page");

        assert_eq!(response.status(), 404);
        assert_eq!(response.reason(), "Not Found");
        match response.body() {
            Body::Bytes(buf) => {
                let page = std::str::from_utf8(buf).unwrap();
                assert!(page.contains("<h1>404 Not Found</h1>"));
                assert!(page.contains("no &lt;such&gt; page"));
                assert!(!page.contains("partial output"));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_no_content_has_no_body() {
        let mut response = Response::new();
        response.set_status(204).append_str("ignored");
        let head = head_text(&mut response);
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(matches!(response.take_body(), Body::Empty));
    }

    #[test]
    fn test_redirect() {
        let mut response = Response::new();
        response.send_redirect(302, "/login");
        assert_eq!(response.status(), 302);
        assert_eq!(response.header("location"), Some("/login"));
    }
}
