//! Structured views of HTTP requests and responses.
use std::fmt::Write as _;
use std::time::Duration;

use crate::mailbox::Origin;

/// Header line length beyond which folding kicks in.
const FOLD_WIDTH: usize = 78;

/// HTTP protocol version of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list. Names are stored lower case.
#[derive(Clone, Debug, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of the named header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all values of the named header with one value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Keep only headers whose (lower case) name passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|(k, _)| keep(k));
    }

    /// Check for a token in a comma separated header, such as
    /// `Connection: keep-alive, Upgrade`.
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An inbound request.
///
/// Besides the headers sent by the client, every request carries synthesized
/// `x-http-*`, `x-local-*`, `x-remote-*` and `x-count-*` headers describing
/// the request line, the connection, and the server load at the time the
/// request header was complete.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) version: Version,
    pub(crate) headers: Headers,
    pub(crate) body: Vec<u8>,
    pub(crate) complete: bool,
}

impl Request {
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string, without the `?`. Empty if there was none.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Body received so far.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// False while incremental processing sees a partial body.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Remote address, after proxy and reverse DNS handling.
    #[must_use]
    pub fn remote_address(&self) -> &str {
        self.headers.get("x-remote-address").unwrap_or("")
    }

    /// HTTP Basic username, if the request carried one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.headers.get("x-http-username")
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.headers.get("x-http-password")
    }
}

/// A response under construction by the delegate.
#[derive(Debug, Default)]
pub struct Response {
    status: Option<u16>,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    close: bool,
    block: Option<Duration>,
    streaming: bool,
    pub(crate) origin: Option<Origin>,
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_origin(origin: Origin) -> Self {
        Self {
            origin: Some(origin),
            ..Self::default()
        }
    }

    /// Canned response with a short plain text body.
    #[must_use]
    pub fn error(status: u16) -> Self {
        let mut r = Self::new();
        r.set_status(status);
        r.set_header("content-type", "text/plain");
        r.set_body(format!("{} {}\n", status, reason_phrase(status)));
        r
    }

    /// Status code. Defaults to 200, or 204 if there's no body.
    ///
    /// The default follows the body as it is now. The server pins it before
    /// taking the body for writing.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self.status {
            Some(s) => s,
            None if self.body.is_empty() && !self.streaming => 204,
            None => 200,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
        self.reason = None;
    }

    pub fn set_status_line(&mut self, status: u16, reason: impl Into<String>) {
        self.status = Some(status);
        self.reason = Some(reason.into());
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status()))
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Close the connection once this response has been written.
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    #[must_use]
    pub fn close(&self) -> bool {
        self.close
    }

    /// Reject further requests from the client address for `duration`. A
    /// zero duration lifts an existing block.
    pub fn block_source(&mut self, duration: Duration) {
        self.block = Some(duration);
    }

    #[must_use]
    pub fn block(&self) -> Option<Duration> {
        self.block
    }

    /// Send the body as a stream. The body present when the response is
    /// handed back is the first chunk, further chunks are sent through a
    /// [`crate::Streamer`].
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    #[must_use]
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /// Handle for sending the rest of a streamed body. None for responses
    /// not created by the server.
    #[must_use]
    pub fn streamer(&self) -> Option<crate::Streamer> {
        self.origin.clone().map(crate::Streamer::new)
    }

    /// Fix the defaulted status, so that taking the body doesn't turn a 200
    /// into a 204.
    pub(crate) fn resolve_status(&mut self) {
        self.status = Some(self.status());
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Serialize the status line and headers.
    ///
    /// `Content-Length`, `Transfer-Encoding`, `Connection`, `Date` and
    /// `Server` are always set by us, whatever the delegate put there.
    pub(crate) fn head_bytes(&self, head: &ResponseHead) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        let _ = write!(
            out,
            "{} {} {}\r\n",
            head.version,
            self.status(),
            clean_value(self.reason())
        );
        for (k, v) in self.headers.iter() {
            if matches!(
                k,
                "content-length" | "transfer-encoding" | "connection" | "date" | "server"
            ) {
                continue;
            }
            if !is_token(k) {
                continue;
            }
            push_header(&mut out, k, &clean_value(v), head.fold);
        }
        let _ = write!(
            out,
            "Date: {}\r\nServer: ringserve/{}\r\n",
            httpdate::fmt_http_date(std::time::SystemTime::now()),
            env!("CARGO_PKG_VERSION")
        );
        match head.framing {
            Framing::Length(n) => {
                if !no_body_status(self.status()) {
                    let _ = write!(out, "Content-Length: {n}\r\n");
                }
            }
            Framing::Chunked => out.push_str("Transfer-Encoding: chunked\r\n"),
            Framing::UntilClose => {}
        }
        out.push_str(if head.keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// How the body following a response head is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
}

pub(crate) struct ResponseHead {
    pub version: Version,
    pub keep_alive: bool,
    pub fold: bool,
    pub framing: Framing,
}

fn no_body_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Whether a response with this status to this method carries a body.
pub(crate) fn has_body(method: &str, status: u16) -> bool {
    method != "HEAD" && !no_body_status(status)
}

// RFC 9110 token characters, the only ones allowed in a field name.
fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

// Control characters other than tab would split or end the header line.
fn clean_value(value: &str) -> std::borrow::Cow<'_, str> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        value
            .chars()
            .map(|c| if c.is_control() && c != '\t' { ' ' } else { c })
            .collect::<String>()
            .into()
    } else {
        value.into()
    }
}

fn push_header(out: &mut String, name: &str, value: &str, fold: bool) {
    let start = out.len();
    out.push_str(name);
    out.push_str(": ");
    if !fold || name.len() + 2 + value.len() <= FOLD_WIDTH {
        out.push_str(value);
        out.push_str("\r\n");
        return;
    }
    let mut line_len = out.len() - start;
    let mut first = true;
    for word in value.split(' ') {
        if !first {
            if line_len + 1 + word.len() > FOLD_WIDTH {
                out.push_str("\r\n ");
                line_len = 1;
            } else {
                out.push(' ');
                line_len += 1;
            }
        }
        out.push_str(word);
        line_len += word.len();
        first = false;
    }
    out.push_str("\r\n");
}

/// Encode one chunk of a chunked body.
pub(crate) fn chunk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

pub(crate) const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(keep_alive: bool, framing: Framing, fold: bool) -> ResponseHead {
        ResponseHead {
            version: Version::Http11,
            keep_alive,
            fold,
            framing,
        }
    }

    #[test]
    fn default_status_depends_on_body() {
        let mut r = Response::new();
        assert_eq!(r.status(), 204);
        r.set_body("x");
        assert_eq!(r.status(), 200);
        r.set_status(404);
        assert_eq!(r.status(), 404);
        assert_eq!(r.reason(), "Not Found");
        r.set_status_line(404, "Gone Fishing");
        assert_eq!(r.reason(), "Gone Fishing");
    }

    #[test]
    fn head_overrides_framing_headers() {
        let mut r = Response::new();
        r.set_body("hello");
        r.set_header("Content-Length", "999");
        r.set_header("X-Thing", "yes");
        let s = String::from_utf8(r.head_bytes(&head(true, Framing::Length(5), false))).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"), "{s}");
        assert!(!s.contains("content-length"), "{s}");
        assert!(s.contains("Content-Length: 5\r\n"), "{s}");
        assert!(s.contains("x-thing: yes\r\n"), "{s}");
        assert!(s.contains("Connection: keep-alive\r\n"), "{s}");
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_content_length_on_204() {
        let r = Response::new();
        let s = String::from_utf8(r.head_bytes(&head(false, Framing::Length(0), false))).unwrap();
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"), "{s}");
        assert!(!s.contains("Content-Length"), "{s}");
        assert!(s.contains("Connection: close\r\n"), "{s}");
    }

    #[test]
    fn folds_long_headers() {
        let mut r = Response::new();
        let long = vec!["word"; 40].join(" ");
        r.set_header("x-long", long.clone());
        let s = String::from_utf8(r.head_bytes(&head(true, Framing::Length(0), true))).unwrap();
        for line in s.split("\r\n") {
            assert!(line.len() <= FOLD_WIDTH, "line too long: {line:?}");
        }
        assert!(s.contains("\r\n word"), "{s}");
        let unfolded = String::from_utf8(r.head_bytes(&head(true, Framing::Length(0), false))).unwrap();
        assert!(unfolded.contains(&long));
    }

    #[test]
    fn header_tokens() {
        let mut h = Headers::new();
        h.append("Connection", "Keep-Alive, Upgrade");
        assert!(h.has_token("connection", "keep-alive"));
        assert!(h.has_token("CONNECTION", "upgrade"));
        assert!(!h.has_token("connection", "close"));
        h.set("connection", "close");
        assert_eq!(h.len(), 1);
        assert!(h.has_token("connection", "close"));
    }

    #[test]
    fn status_survives_taking_the_body() {
        let mut r = Response::new();
        r.set_body("hi");
        r.resolve_status();
        let body = r.take_body();
        assert_eq!(body, b"hi");
        let s = String::from_utf8(r.head_bytes(&head(true, Framing::Length(body.len()), false)))
            .unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"), "{s}");
        assert!(s.contains("Content-Length: 2\r\n"), "{s}");

        let mut empty = Response::new();
        empty.resolve_status();
        assert_eq!(empty.status(), 204);
        empty.set_body("late");
        assert_eq!(empty.status(), 204);
    }

    #[test]
    fn header_lookup_outlives_name() {
        let mut h = Headers::new();
        h.append("X-Forwarded-For", "1.2.3.4");
        h.append("x-forwarded-for", "5.6.7.8");
        let found = {
            let name = String::from("X-FORWARDED-FOR");
            h.get(&name)
        };
        assert_eq!(found, Some("1.2.3.4"));
        let all: Vec<&str> = {
            let name = String::from("x-forwarded-for");
            h.get_all(&name).collect()
        };
        assert_eq!(all, ["1.2.3.4", "5.6.7.8"]);
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn control_characters_stay_inside_the_header() {
        let mut r = Response::new();
        r.set_status_line(200, "OK\r\nX-Evil: 1");
        r.set_header("X-Note", "a\r\nSet-Cookie: session=stolen");
        r.set_header("Bad\r\nName", "x");
        r.set_header("X-Tab", "a\tb");
        let s = String::from_utf8(r.head_bytes(&head(true, Framing::Length(0), false))).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK  X-Evil: 1\r\n"), "{s}");
        assert!(s.contains("x-note: a  Set-Cookie: session=stolen\r\n"), "{s}");
        assert!(!s.contains("\r\nSet-Cookie"), "{s}");
        assert!(!s.contains("\r\nX-Evil"), "{s}");
        assert!(!s.to_ascii_lowercase().contains("bad"), "{s}");
        assert!(s.contains("x-tab: a\tb\r\n"), "{s}");
    }

    #[test]
    fn chunk_encoding() {
        let mut out = Vec::new();
        chunk(&mut out, b"hello world!!!!!!");
        chunk(&mut out, b"");
        assert_eq!(out, b"11\r\nhello world!!!!!!\r\n");
    }

    #[test]
    fn body_presence() {
        assert!(has_body("GET", 200));
        assert!(!has_body("HEAD", 200));
        assert!(!has_body("GET", 304));
        assert!(!has_body("POST", 204));
    }
}
