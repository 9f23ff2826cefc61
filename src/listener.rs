//! The accept loop.
//!
//! Runs on its own thread and ring. Admission is decided here, before a
//! connection gets anywhere near an IOThread. When the server is full and
//! not rejecting, no accept is outstanding, and new clients wait in the
//! kernel backlog until an IOThread signals that a connection has closed.
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, trace, warn};

use crate::admission::{Admission, Decision};
use crate::error::Result;
use crate::io_thread::{self, RING_SIZE, THREAD_STACK_SIZE};
use crate::mailbox::{Incoming, IoMessage, Mailbox, Peer, Wakeup};
use crate::message::{Framing, Response, ResponseHead, Version};
use crate::server::ServerHandle;
use crate::sock;
use crate::tls::TlsSettings;

const USER_DATA_ACCEPT: u64 = u64::MAX;
const USER_DATA_TIMEOUT: u64 = u64::MAX - 1;
const USER_DATA_WAKEUP: u64 = u64::MAX - 2;

// Rejections are written synchronously. A client that doesn't read its
// 503 doesn't get to hold up anything else for long.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

// Reverse lookups take as long as DNS takes. They run here, never on the
// accept thread.
const RESOLVER_THREADS: usize = 2;

/// Answer a connection that won't be served, and close it.
///
/// TLS clients can't be told anything before a handshake, so they are just
/// closed.
pub(crate) fn reject(mut stream: TcpStream, status: u16, tls: bool) {
    if tls {
        return;
    }
    let mut response = Response::error(status);
    let body = response.take_body();
    let mut out = response.head_bytes(&ResponseHead {
        version: Version::Http11,
        keep_alive: false,
        fold: false,
        framing: Framing::Length(body.len()),
    });
    out.extend_from_slice(&body);
    if let Err(e) = stream
        .set_write_timeout(Some(REJECT_WRITE_TIMEOUT))
        .and_then(|()| stream.write_all(&out))
        .and_then(|()| stream.shutdown(std::net::Shutdown::Write))
    {
        trace!("Writing {status} rejection: {e}");
    }
}

/// Where the listener hands connections.
#[derive(Clone)]
pub(crate) struct Target {
    pub mailbox: Mailbox,
    pub load: Arc<AtomicUsize>,
}

pub(crate) struct Listener {
    local: SocketAddr,
    stop: Arc<AtomicBool>,
    wakeup: Wakeup,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Give an admitted connection to its IOThread. The target's load has
/// already been counted.
fn hand_off(target: &Target, incoming: Incoming, admission: &Admission) {
    trace!(
        "Handing {} ({}) to IOThread",
        incoming.peer.identity,
        incoming.peer.address
    );
    let ip = incoming.peer.ip.clone();
    if !target.mailbox.send(IoMessage::Adopt(Box::new(incoming))) {
        warn!("IOThread gone, dropping connection from {ip}");
        target.load.fetch_sub(1, Ordering::Relaxed);
        admission.release(&ip);
    }
}

type Lookup = fn(IpAddr) -> Option<String>;

struct Resolve {
    incoming: Incoming,
    target: Target,
}

/// Threads that fill in the client host name before handing a connection
/// on.
struct Resolver {
    tx: Sender<Resolve>,
}

impl Resolver {
    fn start(threads: usize, lookup: Lookup, server: &ServerHandle) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Resolve>();
        for n in 0..threads {
            let rx = rx.clone();
            let server = server.clone();
            std::thread::Builder::new()
                .name(format!("resolver/{n}"))
                .spawn(move || {
                    // Ends when the Resolver is dropped.
                    for Resolve {
                        mut incoming,
                        target,
                    } in rx
                    {
                        let ip = incoming.peer.remote.ip().to_canonical();
                        if let Some(name) = lookup(ip) {
                            incoming.peer.address = name;
                        }
                        hand_off(&target, incoming, &server.shared.admission);
                    }
                })?;
        }
        Ok(Self { tx })
    }

    /// Queue a connection for lookup. Gives it back if the resolver threads
    /// are gone.
    fn submit(&self, incoming: Incoming, target: Target) -> std::result::Result<(), Incoming> {
        self.tx
            .send(Resolve { incoming, target })
            .map_err(|e| e.into_inner().incoming)
    }
}

impl Listener {
    /// Start accepting on a bound socket.
    ///
    /// # Errors
    ///
    /// Ring setup, or thread spawn failure.
    pub fn start(
        listener: TcpListener,
        tls: TlsSettings,
        targets: Vec<Target>,
        wakeup: Wakeup,
        server: ServerHandle,
    ) -> Result<Self> {
        let local = listener.local_addr()?;
        // Setting TCP_NODELAY on a listening socket sets that option on all
        // incoming connections, which is what we want.
        if let Err(e) = sock::set_nodelay(listener.as_raw_fd()) {
            warn!("Failed to set TCP_NODELAY on {local}: {e}");
        }
        let ring = io_uring::IoUring::builder().dontfork().build(RING_SIZE)?;
        let stop = Arc::new(AtomicBool::new(false));
        let mut accept = Accept {
            listener,
            tls,
            targets,
            wakeup: wakeup.clone(),
            wake_buf: Box::new([0; 8]),
            tick_ts: Box::new(server.tick().into()),
            stop: stop.clone(),
            server,
            resolver: None,
        };
        let handle = std::thread::Builder::new()
            .name("listener".to_string())
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                info!("Listening on {local}");
                if let Err(e) = accept.mainloop(ring) {
                    error!("Listener on {local} failed: {e}");
                }
                info!("Stopped listening on {local}");
            })?;
        Ok(Self {
            local,
            stop,
            wakeup,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting, and close the listening socket. Connections already
    /// accepted are not affected.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wakeup.wake();
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!("Listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Accept {
    listener: TcpListener,
    tls: TlsSettings,
    targets: Vec<Target>,
    wakeup: Wakeup,
    wake_buf: Box<[u8; 8]>,
    tick_ts: Box<io_uring::types::Timespec>,
    stop: Arc<AtomicBool>,
    server: ServerHandle,

    // Started the first time reverse lookup is on.
    resolver: Option<Resolver>,
}

impl Accept {
    fn make_op_accept(&self) -> io_uring::squeue::Entry {
        io_uring::opcode::Accept::new(
            io_uring::types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(USER_DATA_ACCEPT)
    }

    fn mainloop(&mut self, mut ring: io_uring::IoUring) -> std::io::Result<()> {
        let fd = self.wakeup.raw_fd();
        let mut ops = vec![
            self.make_op_accept(),
            io_thread::make_op_timeout(&self.tick_ts, USER_DATA_TIMEOUT),
            io_thread::make_op_wakeup(fd, &mut self.wake_buf, USER_DATA_WAKEUP),
        ];
        let mut accepting = true;
        loop {
            if !ops.is_empty() {
                // SAFETY: the timespec and the wakeup buffer are boxed, and
                // outlive the ring.
                unsafe {
                    for op in ops.drain(..) {
                        if ring.submission().push(&op).is_err() {
                            error!("Listener submission queue full");
                        }
                    }
                }
                ring.submit()?;
            }
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            let mut cq = ring.completion();
            cq.sync();
            if cq.is_empty() {
                drop(cq);
                if let Err(e) = ring.submit_and_wait(1) {
                    if e.kind() != std::io::ErrorKind::Interrupted {
                        warn!("io_uring submit_and_wait(): {e}");
                    }
                }
                continue;
            }
            for cqe in cq {
                let result = cqe.result();
                match cqe.user_data() {
                    USER_DATA_ACCEPT => {
                        accepting = false;
                        if result < 0 {
                            warn!(
                                "Accept failed! {}",
                                std::io::Error::from_raw_os_error(result.abs())
                            );
                            continue;
                        }
                        // SAFETY: accept() just gave us this fd.
                        let stream = unsafe { TcpStream::from_raw_fd(result) };
                        self.admit(stream);
                    }
                    USER_DATA_TIMEOUT => {
                        self.server.shared.auth().expire(Instant::now());
                        ops.push(io_thread::make_op_timeout(&self.tick_ts, USER_DATA_TIMEOUT));
                    }
                    USER_DATA_WAKEUP => {
                        ops.push(io_thread::make_op_wakeup(
                            fd,
                            &mut self.wake_buf,
                            USER_DATA_WAKEUP,
                        ));
                    }
                    other => warn!("Listener got unknown completion {other:x}"),
                }
            }
            let admission = &self.server.shared.admission;
            if !accepting
                && !self.stop.load(Ordering::Acquire)
                && (admission.has_room() || admission.rejecting())
            {
                ops.push(self.make_op_accept());
                accepting = true;
            } else if !accepting {
                trace!("Full, pausing accept");
            }
        }
    }

    fn admit(&mut self, stream: TcpStream) {
        let (remote, local) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(r), Ok(l)) => (r, l),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Connection gone before admission: {e}");
                return;
            }
        };
        let ip = remote.ip().to_canonical();
        let ip_str = ip.to_string();
        let tls = self.tls.for_local(local.ip());
        let admission = &self.server.shared.admission;
        match admission.admit(&ip_str) {
            Decision::Admit => {}
            Decision::Forbidden => {
                debug!("Refusing {ip_str}: not in allowed hosts");
                return reject(stream, 403, tls.is_some());
            }
            Decision::Full => {
                debug!("Refusing {ip_str}: too many connections");
                return reject(stream, 503, tls.is_some());
            }
            Decision::HostFull => {
                debug!("Refusing {ip_str}: too many connections from host");
                return reject(stream, 503, tls.is_some());
            }
        }
        let config = self.server.config();
        let reverse = config.reverse;
        let peer = Peer {
            identity: self.server.shared.next_identity.fetch_add(1, Ordering::Relaxed) + 1,
            remote,
            local,
            quiet: admission.is_quiet(&ip_str),
            address: ip_str.clone(),
            ip: ip_str,
            tls,
            config,
        };
        let Some(target) = self
            .targets
            .iter()
            .min_by_key(|t| t.load.load(Ordering::Relaxed))
        else {
            error!("No IOThreads");
            admission.release(&peer.ip);
            return;
        };
        target.load.fetch_add(1, Ordering::Relaxed);
        let incoming = Incoming { stream, peer };
        if !reverse {
            return hand_off(target, incoming, admission);
        }
        if self.resolver.is_none() {
            match Resolver::start(RESOLVER_THREADS, sock::reverse_lookup, &self.server) {
                Ok(r) => self.resolver = Some(r),
                Err(e) => warn!("Failed to start resolver threads: {e}"),
            }
        }
        let incoming = match &self.resolver {
            Some(resolver) => match resolver.submit(incoming, target.clone()) {
                Ok(()) => return,
                Err(incoming) => incoming,
            },
            None => incoming,
        };
        hand_off(target, incoming, admission);
    }
}
