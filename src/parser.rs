//! Incremental HTTP/1.x request parsing.
//!
//! The head is parsed with `httparse` each time more bytes arrive, until it
//! is complete. The body is then fed through a `BodyDecoder`, which can be
//! given input in arbitrarily small pieces.
use crate::message::{Headers, Version};

// Max number of headers in a request. More than this is treated the same as
// a too large header.
const MAX_HEADERS: usize = 100;

// Max bytes of chunked trailer fields. They are dropped, so they don't count
// towards the body size.
pub(crate) const MAX_TRAILER_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("too many headers")]
    TooManyHeaders,

    #[error("unsupported transfer encoding {0:?}")]
    TransferEncoding(String),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
            httparse::Error::HeaderName => ParseError::Malformed("header name"),
            httparse::Error::HeaderValue => ParseError::Malformed("header value"),
            httparse::Error::NewLine => ParseError::Malformed("newline"),
            httparse::Error::Status => ParseError::Malformed("status"),
            httparse::Error::Token => ParseError::Malformed("token"),
            httparse::Error::Version => ParseError::Malformed("version"),
        }
    }
}

/// Request line and headers, as sent by the client.
#[derive(Debug)]
pub(crate) struct Head {
    pub method: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: Headers,
}

/// Try to parse a request head from the start of `buf`.
///
/// Returns the head and its length in bytes (including the empty line), or
/// None if more data is needed.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };
    let method = req.method.ok_or(ParseError::Malformed("no method"))?;
    let target = req.path.ok_or(ParseError::Malformed("no path"))?;
    let version = match req.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(ParseError::Malformed("version")),
    };
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let mut out = Headers::new();
    for h in req.headers.iter() {
        out.append(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    Ok(Some((
        Head {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            version,
            headers: out,
        },
        len,
    )))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    /// Trailer bytes seen so far.
    Trailer(usize),
}

/// Body framing state for one request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BodyDecoder {
    Done,
    Length(usize),
    Chunked(Chunk),
}

impl BodyDecoder {
    pub fn for_head(head: &Head) -> Result<Self, ParseError> {
        if let Some(te) = head.headers.get("transfer-encoding") {
            // Only plain chunked is supported; nobody sends anything else
            // in a request.
            if head.version == Version::Http11 && te.trim().eq_ignore_ascii_case("chunked") {
                return Ok(BodyDecoder::Chunked(Chunk::Size));
            }
            return Err(ParseError::TransferEncoding(te.to_string()));
        }
        let mut lengths = head.headers.get_all("content-length");
        match lengths.next() {
            None => Ok(BodyDecoder::Done),
            Some(v) => {
                let n: usize = v
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::Malformed("content-length"))?;
                if lengths.any(|o| o.trim() != v.trim()) {
                    return Err(ParseError::Malformed("conflicting content-length"));
                }
                Ok(if n == 0 {
                    BodyDecoder::Done
                } else {
                    BodyDecoder::Length(n)
                })
            }
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, BodyDecoder::Done)
    }

    /// Declared length still to come, for content-length framed bodies.
    #[must_use]
    pub fn remaining_length(&self) -> Option<usize> {
        match self {
            BodyDecoder::Length(n) => Some(*n),
            _ => None,
        }
    }

    /// Decode as much of `input` as possible, appending body bytes to
    /// `body`. Returns the number of input bytes consumed. Anything after the
    /// end of the body is left alone; it's the next pipelined request.
    pub fn decode(&mut self, input: &[u8], body: &mut Vec<u8>) -> Result<usize, ParseError> {
        let mut pos = 0;
        loop {
            let rest = &input[pos..];
            match self {
                BodyDecoder::Done => return Ok(pos),
                BodyDecoder::Length(remaining) => {
                    let n = std::cmp::min(*remaining, rest.len());
                    body.extend_from_slice(&rest[..n]);
                    *remaining -= n;
                    pos += n;
                    if *remaining == 0 {
                        *self = BodyDecoder::Done;
                    }
                    return Ok(pos);
                }
                BodyDecoder::Chunked(Chunk::Size) => match httparse::parse_chunk_size(rest) {
                    Ok(httparse::Status::Complete((n, 0))) => {
                        pos += n;
                        *self = BodyDecoder::Chunked(Chunk::Trailer(0));
                    }
                    Ok(httparse::Status::Complete((n, size))) => {
                        pos += n;
                        *self = BodyDecoder::Chunked(Chunk::Data(size));
                    }
                    Ok(httparse::Status::Partial) => return Ok(pos),
                    Err(_) => return Err(ParseError::Malformed("chunk size")),
                },
                BodyDecoder::Chunked(Chunk::Data(remaining)) => {
                    if rest.is_empty() {
                        return Ok(pos);
                    }
                    let n = usize::try_from(*remaining)
                        .unwrap_or(usize::MAX)
                        .min(rest.len());
                    body.extend_from_slice(&rest[..n]);
                    pos += n;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        *self = BodyDecoder::Chunked(Chunk::DataEnd);
                    }
                }
                BodyDecoder::Chunked(Chunk::DataEnd) => {
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::Malformed("chunk terminator"));
                    }
                    pos += 2;
                    *self = BodyDecoder::Chunked(Chunk::Size);
                }
                BodyDecoder::Chunked(Chunk::Trailer(seen)) => {
                    // Trailer fields are dropped.
                    let Some(end) = rest.windows(2).position(|w| w == b"\r\n") else {
                        if *seen + rest.len() > MAX_TRAILER_SIZE {
                            return Err(ParseError::Malformed("trailer too large"));
                        }
                        return Ok(pos);
                    };
                    *seen += end + 2;
                    if *seen > MAX_TRAILER_SIZE {
                        return Err(ParseError::Malformed("trailer too large"));
                    }
                    pos += end + 2;
                    if end == 0 {
                        *self = BodyDecoder::Done;
                    }
                }
            }
        }
    }
}
