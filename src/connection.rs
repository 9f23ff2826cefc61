//! Per-connection HTTP state machine.
//!
//! A `Connection` never touches its socket. The IOThread feeds it completed
//! reads and writes, worker results and streamed data, and each of those
//! calls returns the `Next` thing the IOThread has to do for it. At most one
//! read or write is ever asked for at a time.
//!
//! Output is double buffered: `out` belongs to the kernel while a write is in
//! flight, and anything produced meanwhile goes to `staged`.
use std::io::{Read as _, Write as _};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::access::{self, Access};
use crate::activity::Activity;
use crate::admission::Counts;
use crate::config::Config;
use crate::mailbox::Peer;
use crate::message::{self, Framing, Request, Response, ResponseHead, Version};
use crate::parser::{self, BodyDecoder, Head, ParseError};

/// Size of the buffer the kernel reads into.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;

/// How long a TLS handshake may sit idle.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HANDSHAKE_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Slot not in use.
    Vacant,
    Handshaking,
    ReadingHeader,
    ReadingBody,

    /// With a worker, or deferred by the delegate.
    Queued,
    Responding,
    KeepaliveIdle,

    /// Close submitted. The slot is recycled when all ops have completed.
    Closed,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Vacant => "vacant",
            State::Handshaking => "handshaking",
            State::ReadingHeader => "readingheader",
            State::ReadingBody => "readingbody",
            State::Queued => "queued",
            State::Responding => "responding",
            State::KeepaliveIdle => "keepalive",
            State::Closed => "closed",
        }
    }
}

/// What the IOThread should do next for a connection.
#[derive(Debug)]
pub(crate) enum Next {
    /// Read into `read_target()`.
    Read,

    /// Write `write_source()`.
    Write,

    /// Hand the request to a worker.
    Dispatch(Request),

    /// Call `on_retry()` after this long.
    Retry(Duration),

    /// Nothing until a message arrives.
    Wait,

    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Read,
    Write,
}

/// Server state a connection needs to consult.
pub(crate) trait Host {
    fn now(&self) -> Instant;

    /// Load counters for the `x-count-*` headers.
    fn counts(&self, ip: &str) -> Counts;

    fn request_started(&mut self);
    fn request_finished(&mut self);

    /// True if requests from `address` must get a 429.
    fn banned(&mut self, address: &str) -> bool;
    fn auth_failed(&mut self, address: &str);
    fn block(&mut self, address: &str, duration: Duration);

    fn access(&self, path: &str, username: Option<&str>, password: Option<&str>) -> Access;

    /// Delegate's incremental processing hint for a new request.
    fn incremental(&self, request: &Request) -> usize;

    /// True if one more connection may go idle in keepalive.
    fn keepalive_available(&self) -> bool;

    fn debug(&self, message: &str);
    fn audit(&self, message: &str);
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

pub(crate) struct Connection {
    pub slot: usize,
    pub identity: u64,
    state: State,

    remote: SocketAddr,
    local: SocketAddr,
    ip: String,
    address: String,
    quiet: bool,
    config: Arc<Config>,
    tls: Option<rustls::ServerConnection>,

    retries: u32,
    retry_op: Pending,

    // A read or write has been asked for and not yet completed.
    io_pending: bool,

    // Cleared when the connection closes, for anybody holding an Origin.
    alive: Arc<AtomicBool>,

    started: Instant,
    request_started: Instant,

    /// Last activity. Only moves forward.
    pub tick: Instant,
    requests: usize,
    bytes_read: usize,

    read_buf: Vec<u8>,
    inbuf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    staged: Vec<u8>,
    close_after_flush: bool,

    // Current request.
    request: Option<Request>,
    method: String,
    target: String,
    version: Version,
    client: String,
    user: Option<String>,
    keep_alive_wanted: bool,
    in_request: bool,
    decoder: BodyDecoder,
    hint: usize,
    dispatched_at: usize,
    awaiting_worker: bool,

    // Current response.
    status: u16,
    keep_alive: bool,
    framing: Framing,
    streaming: bool,
    response_complete: bool,
    stream_early: Vec<u8>,
    stream_ended_early: bool,
    sent_body: usize,
}

impl Connection {
    /// Create a new Connection "slot" in Vacant state.
    #[must_use]
    pub fn new(slot: usize) -> Self {
        Self::with_read_buf(slot, vec![0; READ_BUF_SIZE])
    }

    fn with_read_buf(slot: usize, read_buf: Vec<u8>) -> Self {
        let now = Instant::now();
        Self {
            slot,
            identity: 0,
            state: State::Vacant,
            remote: unspecified(),
            local: unspecified(),
            ip: String::new(),
            address: String::new(),
            quiet: false,
            config: Arc::new(Config::default()),
            tls: None,
            retries: 0,
            retry_op: Pending::Read,
            io_pending: false,
            alive: Arc::new(AtomicBool::new(false)),
            started: now,
            request_started: now,
            tick: now,
            requests: 0,
            bytes_read: 0,
            read_buf,
            inbuf: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            staged: Vec::new(),
            close_after_flush: false,
            request: None,
            method: String::new(),
            target: String::new(),
            version: Version::Http11,
            client: String::new(),
            user: None,
            keep_alive_wanted: false,
            in_request: false,
            decoder: BodyDecoder::Done,
            hint: 0,
            dispatched_at: 0,
            awaiting_worker: false,
            status: 0,
            keep_alive: false,
            framing: Framing::Length(0),
            streaming: false,
            response_complete: false,
            stream_early: Vec::new(),
            stream_ended_early: false,
            sent_body: 0,
        }
    }

    /// Start serving a new client.
    ///
    /// Slots are reused between connections, which is why this is not just
    /// part of `new()`.
    pub fn init(&mut self, peer: Peer, now: Instant) -> Result<Next, rustls::Error> {
        debug_assert_eq!(self.state, State::Vacant);
        let tls = peer
            .tls
            .map(rustls::ServerConnection::new)
            .transpose()?;
        self.identity = peer.identity;
        self.remote = peer.remote;
        self.local = peer.local;
        self.ip = peer.ip;
        self.address = peer.address;
        self.quiet = peer.quiet;
        self.config = peer.config;
        self.alive = Arc::new(AtomicBool::new(true));
        self.started = now;
        self.tick = now;
        self.state = if let Some(mut tls) = tls {
            tls.set_buffer_limit(None);
            self.tls = Some(tls);
            State::Handshaking
        } else {
            State::ReadingHeader
        };
        Ok(self.want_read())
    }

    /// Put the slot back in Vacant state.
    pub fn deinit(&mut self) {
        self.read_buf.as_mut_slice().zeroize();
        self.inbuf.zeroize();
        self.out.zeroize();
        self.staged.zeroize();
        self.stream_early.zeroize();
        self.ip.zeroize();
        self.address.zeroize();
        self.client.zeroize();
        self.target.zeroize();
        if let Some(u) = self.user.as_mut() {
            u.zeroize();
        }
        let read_buf = std::mem::take(&mut self.read_buf);
        *self = Self::with_read_buf(self.slot, read_buf);
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    #[must_use]
    pub fn quiet(&self) -> bool {
        self.quiet
    }

    #[must_use]
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Where the kernel should put the next read.
    pub fn read_target(&mut self) -> &mut [u8] {
        &mut self.read_buf
    }

    /// What the kernel should write next.
    #[must_use]
    pub fn write_source(&self) -> &[u8] {
        &self.out[self.out_pos..]
    }

    /// Which timeout list the connection belongs on.
    #[must_use]
    pub fn activity(&self) -> Option<Activity> {
        Some(match self.state {
            State::Vacant | State::Closed => return None,
            State::Handshaking => Activity::Handshake,
            State::ReadingHeader => Activity::ReadWrite,
            State::ReadingBody if self.awaiting_worker => Activity::Processing,
            State::ReadingBody => Activity::ReadWrite,
            State::Queued => Activity::Processing,
            State::Responding if self.io_pending => Activity::ReadWrite,
            State::Responding => Activity::Processing,
            State::KeepaliveIdle => Activity::Keepalive,
        })
    }

    /// Whether the connection has been inactive too long for its class.
    #[must_use]
    pub fn expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        let idle_for = now.saturating_duration_since(self.tick);
        match self.activity() {
            None => false,
            Some(Activity::Handshake) => idle_for > HANDSHAKE_TIMEOUT,
            Some(Activity::ReadWrite) => idle_for > idle_timeout,
            Some(Activity::Processing) => {
                let max = self.config.max_connection_duration;
                !max.is_zero() && idle_for > max
            }
            Some(Activity::Keepalive) => {
                idle_for > idle_timeout
                    || self
                        .config
                        .duration_exceeded(now.saturating_duration_since(self.started))
            }
        }
    }

    fn want_read(&mut self) -> Next {
        self.io_pending = true;
        Next::Read
    }

    /// Start writing whatever is buffered, if nothing is in flight.
    ///
    /// Returns None if there is nothing to write.
    fn flush(&mut self) -> Option<Next> {
        if self.io_pending {
            return Some(Next::Wait);
        }
        if self.out_pos >= self.out.len() {
            self.out.clear();
            self.out_pos = 0;
            std::mem::swap(&mut self.out, &mut self.staged);
        }
        if self.out.is_empty() {
            return None;
        }
        self.io_pending = true;
        Some(Next::Write)
    }

    fn flush_or_read(&mut self) -> Next {
        match self.flush() {
            Some(next) => next,
            None => self.want_read(),
        }
    }

    // Move everything rustls wants to send into `staged`.
    fn tls_flush(&mut self) {
        let Some(tls) = self.tls.as_mut() else {
            return;
        };
        while tls.wants_write() {
            match tls.write_tls(&mut self.staged) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    /// Queue plaintext for the client.
    fn emit(&mut self, data: &[u8]) {
        match self.tls.as_mut() {
            None => self.staged.extend_from_slice(data),
            Some(tls) => {
                // The buffer limit is off, so this can't come up short.
                if let Err(e) = tls.writer().write_all(data) {
                    debug!("TLS write: {e}");
                }
                self.tls_flush();
            }
        }
    }

    fn emit_chunk(&mut self, data: &[u8]) {
        match self.framing {
            Framing::Chunked => {
                let mut buf = Vec::with_capacity(data.len() + 16);
                message::chunk(&mut buf, data);
                self.emit(&buf);
            }
            Framing::UntilClose => self.emit(data),
            Framing::Length(_) => return,
        }
        self.sent_body += data.len();
    }

    fn raw_log(&self, host: &dyn Host, dir: &str, data: &[u8]) {
        if self.config.log_raw_io && !self.quiet {
            host.debug(&format!(
                "{dir} {} bytes on {}: {:?}",
                data.len(),
                self.identity,
                String::from_utf8_lossy(data)
            ));
        }
    }

    /// A read has completed.
    pub fn on_read(&mut self, result: std::io::Result<usize>, host: &mut dyn Host) -> Next {
        self.io_pending = false;
        let n = match result {
            Ok(n) => n,
            Err(e) => return self.io_error(&e, Pending::Read),
        };
        if n == 0 {
            return self.eof();
        }
        self.bytes_read += n;
        self.raw_log(host, "Read", &self.read_buf[..n]);
        if self.tls.is_some() {
            if let Some(next) = self.decrypt(n) {
                return next;
            }
        } else {
            self.inbuf.extend_from_slice(&self.read_buf[..n]);
        }
        if self.state == State::KeepaliveIdle && !self.inbuf.is_empty() {
            self.state = State::ReadingHeader;
        }
        self.advance(host)
    }

    // Feed received bytes through rustls. Returns Some if the connection
    // has to go down.
    fn decrypt(&mut self, n: usize) -> Option<Next> {
        let tls = self.tls.as_mut()?;
        let mut input = &self.read_buf[..n];
        while !input.is_empty() {
            match tls.read_tls(&mut input) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("TLS read: {e}");
                    return Some(Next::Close);
                }
            }
            if let Err(e) = tls.process_new_packets() {
                debug!("TLS error: {e}");
                // Send the alert, if any, then hang up.
                self.tls_flush();
                self.close_after_flush = true;
                return Some(self.flush().unwrap_or(Next::Close));
            }
            let mut chunk = [0u8; 4096];
            loop {
                match tls.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(k) => self.inbuf.extend_from_slice(&chunk[..k]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("TLS plaintext read: {e}");
                        break;
                    }
                }
            }
        }
        if self.state == State::Handshaking && !tls.is_handshaking() {
            debug!(
                "Handshake done on {}: {:?}",
                self.identity,
                tls.negotiated_cipher_suite()
            );
            self.state = State::ReadingHeader;
        }
        self.tls_flush();
        None
    }

    /// A write has completed.
    pub fn on_written(&mut self, result: std::io::Result<usize>, host: &mut dyn Host) -> Next {
        self.io_pending = false;
        let n = match result {
            Ok(0) => return Next::Close,
            Ok(n) => n,
            Err(e) => return self.io_error(&e, Pending::Write),
        };
        let end = std::cmp::min(self.out_pos + n, self.out.len());
        self.raw_log(host, "Wrote", &self.out[self.out_pos..end]);
        self.out_pos = end;
        if let Some(next) = self.flush() {
            return next;
        }
        if self.close_after_flush {
            return Next::Close;
        }
        match self.state {
            State::Responding if self.response_complete => self.response_done(host),
            State::Responding => Next::Wait,
            _ => self.advance(host),
        }
    }

    /// The handshake retry timer fired.
    pub fn on_retry(&mut self) -> Next {
        self.io_pending = true;
        match self.retry_op {
            Pending::Read => Next::Read,
            Pending::Write => Next::Write,
        }
    }

    fn io_error(&mut self, e: &std::io::Error, op: Pending) -> Next {
        let transient = matches!(
            e.raw_os_error(),
            Some(libc::EAGAIN | libc::EINTR | libc::ENOBUFS)
        );
        if self.state == State::Handshaking && transient && self.retries < MAX_HANDSHAKE_RETRIES {
            let delay = RETRY_BACKOFF * 2u32.pow(self.retries);
            self.retries += 1;
            self.retry_op = op;
            debug!("Handshake I/O error on {}: {e}, retry in {delay:?}", self.identity);
            return Next::Retry(delay);
        }
        debug!("I/O error on {} in {}: {e}", self.identity, self.state.name());
        Next::Close
    }

    fn eof(&mut self) -> Next {
        match self.state {
            State::KeepaliveIdle => trace!("Client closed idle connection {}", self.identity),
            State::ReadingHeader if self.inbuf.is_empty() => {
                trace!("Client closed connection {}", self.identity);
            }
            s => debug!(
                "Client disconnected from {} in state {}",
                self.identity,
                s.name()
            ),
        }
        Next::Close
    }

    fn advance(&mut self, host: &mut dyn Host) -> Next {
        loop {
            match self.state {
                State::Handshaking => return self.flush_or_read(),
                State::ReadingHeader | State::KeepaliveIdle => {
                    if self.inbuf.is_empty() {
                        return self.flush_or_read();
                    }
                    self.state = State::ReadingHeader;
                    match parser::parse_head(&self.inbuf) {
                        Err(ParseError::TooManyHeaders) => return self.fail(413, host),
                        Err(e) => {
                            debug!("Bad request on {}: {e}", self.identity);
                            return self.fail(400, host);
                        }
                        Ok(None) => {
                            if self.inbuf.len() > self.config.max_request_size {
                                return self.fail(413, host);
                            }
                            return self.flush_or_read();
                        }
                        Ok(Some((head, len))) => {
                            if len > self.config.max_request_size {
                                return self.fail(413, host);
                            }
                            self.inbuf.drain(..len);
                            if let Some(next) = self.header_complete(head, host) {
                                return next;
                            }
                        }
                    }
                }
                State::ReadingBody => {
                    if self.awaiting_worker {
                        return self.flush().unwrap_or(Next::Wait);
                    }
                    let Some(request) = self.request.as_mut() else {
                        return Next::Close;
                    };
                    match self.decoder.decode(&self.inbuf, &mut request.body) {
                        Ok(n) => {
                            self.inbuf.drain(..n);
                        }
                        Err(e) => {
                            debug!("Bad body on {}: {e}", self.identity);
                            return self.fail(400, host);
                        }
                    }
                    let len = request.body.len();
                    if len > self.config.max_body_size {
                        return self.fail(413, host);
                    }
                    // Whatever the decoder left is an unfinished chunk size
                    // or trailer line. It can't legitimately be this long.
                    if !self.decoder.is_done() && self.inbuf.len() > self.config.max_request_size {
                        debug!("Runaway chunk framing on {}", self.identity);
                        return self.fail(400, host);
                    }
                    if self.decoder.is_done() {
                        return self.dispatch(true);
                    }
                    if self.hint > 0 && len - self.dispatched_at >= self.hint {
                        self.dispatched_at = len;
                        return self.dispatch(false);
                    }
                    return self.flush_or_read();
                }
                State::Queued | State::Responding => return self.flush().unwrap_or(Next::Wait),
                State::Vacant | State::Closed => return Next::Close,
            }
        }
    }

    fn dispatch(&mut self, complete: bool) -> Next {
        let Some(mut request) = self.request.take() else {
            return Next::Close;
        };
        request.complete = complete;
        if complete {
            self.state = State::Queued;
        } else {
            self.awaiting_worker = true;
        }
        Next::Dispatch(request)
    }

    // Returns None if the body should be read next.
    fn header_complete(&mut self, head: Head, host: &mut dyn Host) -> Option<Next> {
        self.request_started = host.now();
        self.requests += 1;
        self.in_request = true;
        host.request_started();

        self.method = head.method.clone();
        self.version = head.version;
        self.target = if head.query.is_empty() {
            head.path.clone()
        } else {
            format!("{}?{}", head.path, head.query)
        };
        self.keep_alive_wanted = match head.version {
            Version::Http11 => !head.headers.has_token("connection", "close"),
            Version::Http10 => head.headers.has_token("connection", "keep-alive"),
        };
        let expect_continue = head.version == Version::Http11
            && head
                .headers
                .get("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));
        let decoder = BodyDecoder::for_head(&head);
        let request = self.build_request(head, host);
        self.client = request.remote_address().to_string();
        self.user = request.username().map(str::to_string);
        if self.config.verbose && !self.quiet {
            host.debug(&format!(
                "Request {} from {}: {} {} {}",
                self.identity, self.client, self.method, self.target, self.version
            ));
        }

        if host.banned(&self.client) {
            debug!("Throttling {}", self.client);
            return Some(self.fail(429, host));
        }
        if !self.config.permits(&self.method) {
            let mut response = Response::error(405);
            response.set_header("allow", self.config.allow_header());
            return Some(self.respond_local(response, host));
        }
        let decoder = match decoder {
            Ok(d) => d,
            Err(e) => {
                debug!("Bad request on {}: {e}", self.identity);
                return Some(self.fail(400, host));
            }
        };
        if decoder
            .remaining_length()
            .is_some_and(|n| n > self.config.max_body_size)
        {
            return Some(self.fail(413, host));
        }
        if let Access::Denied { realm } =
            host.access(request.path(), request.username(), request.password())
        {
            let mut response = Response::error(401);
            response.set_header("www-authenticate", access::challenge(&realm));
            return Some(self.respond_local(response, host));
        }

        let body_done = decoder.is_done();
        self.decoder = decoder;
        self.hint = 0;
        self.dispatched_at = 0;
        if !body_done {
            // Resolved before any incremental processing can see the body.
            if expect_continue {
                self.emit(message::CONTINUE);
            }
            self.hint = host.incremental(&request);
        }
        self.request = Some(request);
        if body_done {
            return Some(self.dispatch(true));
        }
        self.state = State::ReadingBody;
        None
    }

    fn build_request(&self, head: Head, host: &dyn Host) -> Request {
        let Head {
            method,
            path,
            query,
            version,
            mut headers,
        } = head;
        let proxy = self.config.secure_proxy;

        // Client supplied copies of our own headers are never trusted. A
        // secure proxy is trusted to have set the certificate ones.
        headers.retain(|name| {
            !(name.starts_with("x-http-")
                || name.starts_with("x-local-")
                || name.starts_with("x-remote-")
                || name.starts_with("x-count-")
                || (!proxy && name.starts_with("x-cert-")))
        });

        // Remote address, by precedence.
        let forwarded = proxy
            .then(|| headers.get("x-forwarded-for"))
            .flatten()
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let remote = [forwarded, Some(self.address.clone())]
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_default();
        let scheme = if proxy || self.tls.is_some() {
            "https"
        } else {
            "http"
        };
        let credentials = headers
            .get("authorization")
            .and_then(access::basic_credentials);
        let counts = host.counts(&self.ip);

        headers.set("x-http-method", &method);
        headers.set("x-http-path", &path);
        headers.set("x-http-query", &query);
        headers.set("x-http-scheme", scheme);
        headers.set("x-http-version", version.as_str());
        if let Some((user, password)) = credentials {
            headers.set("x-http-username", user);
            headers.set("x-http-password", password);
        }
        headers.set("x-local-address", self.local.ip().to_canonical().to_string());
        headers.set("x-local-port", self.local.port().to_string());
        headers.set("x-remote-address", remote);
        headers.set("x-remote-port", self.remote.port().to_string());
        headers.set("x-count-requests", counts.requests.to_string());
        headers.set("x-count-connections", counts.connections.to_string());
        headers.set("x-count-connected-hosts", counts.hosts.to_string());
        headers.set("x-count-host-connections", counts.host_connections.to_string());

        Request {
            method,
            path,
            query,
            version,
            headers,
            body: Vec::new(),
            complete: false,
        }
    }

    fn fail(&mut self, status: u16, host: &mut dyn Host) -> Next {
        self.respond_local(Response::error(status), host)
    }

    // A response produced without the delegate. The rest of the request is
    // never read, so the connection can't be reused.
    fn respond_local(&mut self, mut response: Response, host: &mut dyn Host) -> Next {
        response.set_close(true);
        self.start_response(response, host)
    }

    /// A worker, or the delegate itself, finished a response.
    pub fn on_response(&mut self, response: Response, host: &mut dyn Host) -> Next {
        match self.state {
            State::Queued => {}
            State::ReadingBody if self.awaiting_worker => {}
            s => {
                debug!(
                    "Response for {} arrived in state {}, dropping",
                    self.identity,
                    s.name()
                );
                return Next::Wait;
            }
        }
        self.start_response(response, host)
    }

    /// An incremental processing step is done.
    pub fn on_partial(&mut self, request: Request, host: &mut dyn Host) -> Next {
        if self.state != State::ReadingBody || !self.awaiting_worker {
            return Next::Wait;
        }
        self.awaiting_worker = false;
        self.request = Some(request);
        self.advance(host)
    }

    fn start_response(&mut self, mut response: Response, host: &mut dyn Host) -> Next {
        // A response before the body is all in means the rest of it is
        // never read.
        let body_unread = self.state != State::Queued;
        self.awaiting_worker = false;
        self.request = None;
        if let Some(d) = response.block() {
            host.block(&self.client, d);
        }
        response.resolve_status();
        let status = response.status();
        if status == 401 && !self.client.is_empty() {
            host.auth_failed(&self.client);
        }

        let now = host.now();
        let mut keep_alive = self.keep_alive_wanted
            && !body_unread
            && !response.close()
            && !self.config.requests_exceeded(self.requests)
            && !self
                .config
                .duration_exceeded(now.saturating_duration_since(self.started))
            && host.keepalive_available();

        let body_allowed = message::has_body(&self.method, status);
        let body = response.take_body();
        let streaming = response.streaming() && body_allowed;
        let framing = if streaming {
            match self.version {
                Version::Http11 => Framing::Chunked,
                Version::Http10 => {
                    keep_alive = false;
                    Framing::UntilClose
                }
            }
        } else {
            Framing::Length(body.len())
        };
        let head = response.head_bytes(&ResponseHead {
            version: self.version,
            keep_alive,
            fold: self.config.fold_headers,
            framing,
        });
        self.emit(&head);

        self.status = status;
        self.keep_alive = keep_alive;
        self.framing = framing;
        self.streaming = streaming;
        self.sent_body = 0;
        if streaming {
            self.emit_chunk(&body);
            let early = std::mem::take(&mut self.stream_early);
            self.emit_chunk(&early);
            self.response_complete = self.stream_ended_early;
            if self.response_complete && framing == Framing::Chunked {
                self.emit(message::LAST_CHUNK);
            }
        } else {
            if body_allowed {
                self.emit(&body);
                self.sent_body = body.len();
            }
            self.response_complete = true;
        }
        if self.config.verbose && !self.quiet {
            host.debug(&format!(
                "Response {} to {}: {} {} keepalive={keep_alive}",
                self.identity,
                self.client,
                status,
                response.reason()
            ));
        }
        self.state = State::Responding;
        match self.flush() {
            Some(next) => next,
            None => self.response_done(host),
        }
    }

    /// More body for a streamed response.
    pub fn on_stream_data(&mut self, data: &[u8]) -> Next {
        match self.state {
            State::Queued | State::ReadingBody => {
                self.stream_early.extend_from_slice(data);
                Next::Wait
            }
            State::Responding if self.streaming && !self.response_complete => {
                self.emit_chunk(data);
                self.flush().unwrap_or(Next::Wait)
            }
            _ => Next::Wait,
        }
    }

    /// End of a streamed response.
    pub fn on_stream_end(&mut self, host: &mut dyn Host) -> Next {
        match self.state {
            State::Queued | State::ReadingBody => {
                self.stream_ended_early = true;
                Next::Wait
            }
            State::Responding if self.streaming && !self.response_complete => {
                self.response_complete = true;
                if self.framing == Framing::Chunked {
                    self.emit(message::LAST_CHUNK);
                }
                match self.flush() {
                    Some(next) => next,
                    None => self.response_done(host),
                }
            }
            _ => Next::Wait,
        }
    }

    fn response_done(&mut self, host: &mut dyn Host) -> Next {
        let now = host.now();
        if !self.quiet {
            host.audit(&format!(
                "{} - {} [{}] \"{} {} {}\" {} {}",
                if self.client.is_empty() {
                    &self.address
                } else {
                    &self.client
                },
                self.user.as_deref().unwrap_or("-"),
                httpdate::fmt_http_date(std::time::SystemTime::now()),
                if self.method.is_empty() { "-" } else { &self.method },
                if self.target.is_empty() { "-" } else { &self.target },
                self.version,
                self.status,
                self.sent_body,
            ));
            if self.config.durations {
                host.debug(&format!(
                    "Request {} took {:?}",
                    self.identity,
                    now.saturating_duration_since(self.request_started)
                ));
            }
        }
        if self.in_request {
            self.in_request = false;
            host.request_finished();
        }
        let keep_alive = self.keep_alive;
        self.reset_request();
        if !keep_alive {
            return self.shutdown_output();
        }
        if !self.inbuf.is_empty() {
            // Pipelined request.
            self.state = State::ReadingHeader;
            return self.advance(host);
        }
        if !host.keepalive_available() {
            debug!("No keepalive slot for {}", self.identity);
            return self.shutdown_output();
        }
        self.state = State::KeepaliveIdle;
        self.want_read()
    }

    fn reset_request(&mut self) {
        self.request = None;
        self.method.clear();
        self.target.clear();
        self.user = None;
        self.keep_alive_wanted = false;
        self.decoder = BodyDecoder::Done;
        self.hint = 0;
        self.dispatched_at = 0;
        self.awaiting_worker = false;
        self.status = 0;
        self.keep_alive = false;
        self.framing = Framing::Length(0);
        self.streaming = false;
        self.response_complete = false;
        self.stream_early.clear();
        self.stream_ended_early = false;
        self.sent_body = 0;
    }

    fn shutdown_output(&mut self) -> Next {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            self.tls_flush();
            self.close_after_flush = true;
            return self.flush().unwrap_or(Next::Close);
        }
        Next::Close
    }

    /// The IOThread is closing the connection. Releases anything counted
    /// against it.
    pub fn closed(&mut self, host: &mut dyn Host) {
        self.state = State::Closed;
        self.io_pending = false;
        self.alive.store(false, Ordering::Release);
        if self.in_request {
            self.in_request = false;
            host.request_finished();
        }
        if self.config.durations && !self.quiet {
            host.debug(&format!(
                "Connection {} from {} lasted {:?}, {} requests, {} bytes read",
                self.identity,
                self.address,
                host.now().saturating_duration_since(self.started),
                self.requests,
                self.bytes_read,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeHost {
        now: Option<Instant>,
        banned: bool,
        no_keepalive: bool,
        hint: usize,
        access: Option<String>,
        requests: i64,
        failures: Vec<String>,
        blocks: Vec<(String, Duration)>,
        audit: RefCell<Vec<String>>,
        debug: RefCell<Vec<String>>,
    }

    impl Host for FakeHost {
        fn now(&self) -> Instant {
            self.now.unwrap_or_else(Instant::now)
        }
        fn counts(&self, _ip: &str) -> Counts {
            Counts {
                requests: 1,
                connections: 2,
                hosts: 3,
                host_connections: 4,
            }
        }
        fn request_started(&mut self) {
            self.requests += 1;
        }
        fn request_finished(&mut self) {
            self.requests -= 1;
        }
        fn banned(&mut self, _address: &str) -> bool {
            self.banned
        }
        fn auth_failed(&mut self, address: &str) {
            self.failures.push(address.to_string());
        }
        fn block(&mut self, address: &str, duration: Duration) {
            self.blocks.push((address.to_string(), duration));
        }
        fn access(&self, _path: &str, username: Option<&str>, _password: Option<&str>) -> Access {
            match &self.access {
                None => Access::Open,
                Some(_) if username == Some("fred") => Access::Granted,
                Some(realm) => Access::Denied {
                    realm: realm.clone(),
                },
            }
        }
        fn incremental(&self, _request: &Request) -> usize {
            self.hint
        }
        fn keepalive_available(&self) -> bool {
            !self.no_keepalive
        }
        fn debug(&self, message: &str) {
            self.debug.borrow_mut().push(message.to_string());
        }
        fn audit(&self, message: &str) {
            self.audit.borrow_mut().push(message.to_string());
        }
    }

    fn peer(config: Config) -> Peer {
        Peer {
            identity: 7,
            remote: "192.0.2.1:4711".parse().unwrap(),
            local: "198.51.100.1:80".parse().unwrap(),
            ip: "192.0.2.1".to_string(),
            address: "192.0.2.1".to_string(),
            quiet: false,
            tls: None,
            config: Arc::new(config),
        }
    }

    fn connect(config: Config) -> Connection {
        let mut c = Connection::new(0);
        assert!(matches!(
            c.init(peer(config), Instant::now()).unwrap(),
            Next::Read
        ));
        assert_eq!(c.state(), State::ReadingHeader);
        c
    }

    fn feed(c: &mut Connection, host: &mut FakeHost, data: &[u8]) -> Next {
        c.read_target()[..data.len()].copy_from_slice(data);
        c.on_read(Ok(data.len()), host)
    }

    // Complete writes until the connection wants something else. Returns
    // everything written.
    fn drain(c: &mut Connection, host: &mut FakeHost, mut next: Next) -> (String, Next) {
        let mut out = Vec::new();
        while let Next::Write = next {
            let data = c.write_source().to_vec();
            out.extend_from_slice(&data);
            next = c.on_written(Ok(data.len()), host);
        }
        (String::from_utf8(out).unwrap(), next)
    }

    fn dispatched(next: Next) -> Request {
        match next {
            Next::Dispatch(r) => r,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn get_round_trip_keeps_alive() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"GET /hello?x=1 HTTP/1.1\r\nHost: h\r\n\r\n",
        ));
        assert!(req.is_complete());
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.header("x-http-query"), Some("x=1"));
        assert_eq!(req.header("x-remote-port"), Some("4711"));
        assert_eq!(req.header("x-local-address"), Some("198.51.100.1"));
        assert_eq!(req.header("x-count-host-connections"), Some("4"));
        assert_eq!(c.state(), State::Queued);
        assert_eq!(c.activity(), Some(Activity::Processing));

        let mut resp = Response::new();
        resp.set_body("hi");
        let next = c.on_response(resp, &mut host);
        assert_eq!(c.activity(), Some(Activity::ReadWrite));
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("Content-Length: 2\r\n"), "{out}");
        assert!(out.contains("Connection: keep-alive\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\nhi"), "{out}");
        assert!(matches!(next, Next::Read));
        assert_eq!(c.state(), State::KeepaliveIdle);
        assert_eq!(c.activity(), Some(Activity::Keepalive));
        assert_eq!(host.requests, 0);
        assert_eq!(host.audit.borrow().len(), 1);
        assert!(host.audit.borrow()[0].contains("\"GET /hello?x=1 HTTP/1.1\" 200 2"));

        // Second request on the same connection.
        let req = dispatched(feed(&mut c, &mut host, b"GET /again HTTP/1.1\r\n\r\n"));
        assert_eq!(req.path(), "/again");
    }

    #[test]
    fn body_too_large() {
        let mut host = FakeHost::default();
        let mut c = connect(Config {
            max_body_size: 10,
            ..Config::default()
        });
        let next = feed(
            &mut c,
            &mut host,
            b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
        );
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 413 "), "{out}");
        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(matches!(next, Next::Close));
    }

    #[test]
    fn chunked_body_too_large() {
        let mut host = FakeHost::default();
        let mut c = connect(Config {
            max_body_size: 10,
            ..Config::default()
        });
        assert!(matches!(
            feed(
                &mut c,
                &mut host,
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n",
            ),
            Next::Read
        ));
        let next = feed(&mut c, &mut host, b"5\r\nworld\r\n0\r\n\r\n");
        let (out, _) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 413 "), "{out}");
    }

    #[test]
    fn unterminated_chunk_framing_is_bounded() {
        for tail in [&b"0\r\n"[..], &b"5;"[..]] {
            let mut host = FakeHost::default();
            let mut c = connect(Config {
                max_request_size: 64,
                ..Config::default()
            });
            assert!(matches!(
                feed(
                    &mut c,
                    &mut host,
                    b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                ),
                Next::Read
            ));
            assert!(matches!(feed(&mut c, &mut host, tail), Next::Read));
            let next = feed(&mut c, &mut host, &[b'a'; 100]);
            let (out, next) = drain(&mut c, &mut host, next);
            assert!(out.starts_with("HTTP/1.1 400 "), "{out}");
            assert!(matches!(next, Next::Close));
        }
    }

    #[test]
    fn method_not_allowed() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let next = feed(&mut c, &mut host, b"BREW /pot HTTP/1.1\r\n\r\n");
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 405 "), "{out}");
        assert!(
            out.contains("allow: DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT\r\n"),
            "{out}"
        );
        assert!(matches!(next, Next::Close));
    }

    #[test]
    fn header_too_large() {
        let mut host = FakeHost::default();
        let mut c = connect(Config {
            max_request_size: 32,
            ..Config::default()
        });
        let next = feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaa",
        );
        let (out, _) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 413 "), "{out}");
    }

    #[test]
    fn malformed_request() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let next = feed(&mut c, &mut host, b"\x16\x03\x01 garbage\r\n\r\n");
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 400 "), "{out}");
        assert!(matches!(next, Next::Close));
    }

    #[test]
    fn banned_client() {
        let mut host = FakeHost {
            banned: true,
            ..FakeHost::default()
        };
        let mut c = connect(Config::default());
        let next = feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n");
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 429 "), "{out}");
        assert!(matches!(next, Next::Close));
    }

    #[test]
    fn access_denied_records_failure() {
        let mut host = FakeHost {
            access: Some("secret".to_string()),
            ..FakeHost::default()
        };
        let mut c = connect(Config::default());
        let next = feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n");
        let (out, _) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.1 401 "), "{out}");
        assert!(out.contains("www-authenticate: Basic realm=\"secret\""), "{out}");
        assert_eq!(host.failures, vec!["192.0.2.1".to_string()]);

        // "fred:x"
        let mut c = connect(Config::default());
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.1\r\nAuthorization: Basic ZnJlZDp4\r\n\r\n",
        ));
        assert_eq!(req.username(), Some("fred"));
        assert_eq!(req.password(), Some("x"));
    }

    #[test]
    fn http10_closes_unless_asked() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.0\r\n\r\n"));
        let next = c.on_response(Response::new(), &mut host);
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.starts_with("HTTP/1.0 204 No Content\r\n"), "{out}");
        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(matches!(next, Next::Close));

        let mut c = connect(Config::default());
        dispatched(feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        ));
        let next = c.on_response(Response::new(), &mut host);
        let (_, next) = drain(&mut c, &mut host, next);
        assert!(matches!(next, Next::Read));
    }

    #[test]
    fn keepalive_refused_when_slots_full() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
        host.no_keepalive = true;
        let next = c.on_response(Response::new(), &mut host);
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(matches!(next, Next::Close));
    }

    #[test]
    fn max_requests_per_connection() {
        let mut host = FakeHost::default();
        let mut c = connect(Config {
            max_connection_requests: 2,
            ..Config::default()
        });
        for (n, want) in [(1, "keep-alive"), (2, "close")] {
            dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
            let next = c.on_response(Response::new(), &mut host);
            let (out, _) = drain(&mut c, &mut host, next);
            assert!(
                out.contains(&format!("Connection: {want}\r\n")),
                "request {n}: {out}"
            );
        }
    }

    #[test]
    fn pipelined_requests() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n",
        ));
        assert_eq!(req.path(), "/1");
        let next = c.on_response(Response::new(), &mut host);
        let (_, next) = drain(&mut c, &mut host, next);
        let req = dispatched(next);
        assert_eq!(req.path(), "/2");
    }

    #[test]
    fn expect_continue_before_body() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let next = feed(
            &mut c,
            &mut host,
            b"PUT /up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
        );
        let (out, next) = drain(&mut c, &mut host, next);
        assert_eq!(out, "HTTP/1.1 100 Continue\r\n\r\n");
        assert!(matches!(next, Next::Read));
        let req = dispatched(feed(&mut c, &mut host, b"hello"));
        assert_eq!(req.body(), b"hello");
    }

    #[test]
    fn incremental_body() {
        let mut host = FakeHost {
            hint: 4,
            ..FakeHost::default()
        };
        let mut c = connect(Config::default());
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabcde",
        ));
        assert!(!req.is_complete());
        assert_eq!(req.body(), b"abcde");
        assert_eq!(c.activity(), Some(Activity::Processing));
        assert!(matches!(c.on_partial(req, &mut host), Next::Read));
        assert_eq!(c.activity(), Some(Activity::ReadWrite));
        let req = dispatched(feed(&mut c, &mut host, b"fghij"));
        assert!(req.is_complete());
        assert_eq!(req.body(), b"abcdefghij");
    }

    #[test]
    fn streamed_response() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
        // Data may show up before the response itself.
        assert!(matches!(c.on_stream_data(b"early "), Next::Wait));
        let mut resp = Response::new();
        resp.set_streaming(true);
        resp.set_body("first ");
        let next = c.on_response(resp, &mut host);
        let (out, next) = drain(&mut c, &mut host, next);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n6\r\nfirst \r\n6\r\nearly \r\n"), "{out}");
        assert!(matches!(next, Next::Wait));
        assert_eq!(c.activity(), Some(Activity::Processing));

        let next = c.on_stream_data(b"more");
        let (out, _) = drain(&mut c, &mut host, next);
        assert_eq!(out, "4\r\nmore\r\n");
        let next = c.on_stream_end(&mut host);
        let (out, next) = drain(&mut c, &mut host, next);
        assert_eq!(out, "0\r\n\r\n");
        assert!(matches!(next, Next::Read));
        assert_eq!(c.state(), State::KeepaliveIdle);
    }

    #[test]
    fn streamed_http10_until_close() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        dispatched(feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        ));
        let mut resp = Response::new();
        resp.set_streaming(true);
        let next = c.on_response(resp, &mut host);
        let (out, _) = drain(&mut c, &mut host, next);
        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(!out.contains("Transfer-Encoding"), "{out}");
        let next = c.on_stream_data(b"raw");
        let (out, _) = drain(&mut c, &mut host, next);
        assert_eq!(out, "raw");
        assert!(matches!(c.on_stream_end(&mut host), Next::Close));
    }

    #[test]
    fn delegate_401_and_block() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
        let mut resp = Response::new();
        resp.set_status(401);
        resp.block_source(Duration::from_secs(5));
        let next = c.on_response(resp, &mut host);
        drain(&mut c, &mut host, next);
        assert_eq!(host.failures, vec!["192.0.2.1".to_string()]);
        assert_eq!(
            host.blocks,
            vec![("192.0.2.1".to_string(), Duration::from_secs(5))]
        );
    }

    #[test]
    fn synthesized_headers_not_spoofable() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.1\r\nX-Remote-Address: 10.0.0.1\r\nX-Cert-Subject: CN=evil\r\nX-Forwarded-For: 10.0.0.2\r\n\r\n",
        ));
        assert_eq!(req.remote_address(), "192.0.2.1");
        assert_eq!(req.header("x-cert-subject"), None);
        assert_eq!(req.header("x-http-scheme"), Some("http"));

        let mut c = connect(Config {
            secure_proxy: true,
            ..Config::default()
        });
        let req = dispatched(feed(
            &mut c,
            &mut host,
            b"GET / HTTP/1.1\r\nX-Cert-Subject: CN=proxy\r\nX-Forwarded-For: 10.0.0.2, 10.0.0.3\r\n\r\n",
        ));
        assert_eq!(req.remote_address(), "10.0.0.2");
        assert_eq!(req.header("x-cert-subject"), Some("CN=proxy"));
        assert_eq!(req.header("x-http-scheme"), Some("https"));
    }

    #[test]
    fn timeouts_by_class() {
        let idle = Duration::from_secs(30);
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let t0 = c.tick;
        assert!(!c.expired(t0 + Duration::from_secs(30), idle));
        assert!(c.expired(t0 + Duration::from_secs(31), idle));

        // Processing is bounded by the max connection duration instead.
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
        assert!(!c.expired(t0 + Duration::from_secs(10), idle));
        assert!(c.expired(t0 + Duration::from_secs(11), idle));

        let next = c.on_response(Response::new(), &mut host);
        drain(&mut c, &mut host, next);
        assert_eq!(c.activity(), Some(Activity::Keepalive));
        // Keepalive is also bounded by connection age.
        c.tick = t0 + Duration::from_secs(9);
        assert!(!c.expired(t0 + Duration::from_secs(9), idle));
        assert!(c.expired(t0 + Duration::from_secs(10), idle));
    }

    #[test]
    fn io_errors_and_eof_close() {
        let mut host = FakeHost::default();
        let mut c = connect(Config::default());
        let e = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(matches!(c.on_read(Err(e), &mut host), Next::Close));

        let mut c = connect(Config::default());
        assert!(matches!(c.on_read(Ok(0), &mut host), Next::Close));

        let mut c = connect(Config::default());
        dispatched(feed(&mut c, &mut host, b"GET / HTTP/1.1\r\n\r\n"));
        c.closed(&mut host);
        assert_eq!(host.requests, 0);
        assert!(!c.alive_flag().load(Ordering::Acquire));
        c.deinit();
        assert_eq!(c.state(), State::Vacant);
        assert_eq!(c.read_target().len(), READ_BUF_SIZE);
    }
}
