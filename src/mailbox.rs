//! Cross thread handoff into an IOThread.
//!
//! Only the owning IOThread touches a connection's socket. Everybody else
//! (the listener, workers, and delegate threads completing deferred or
//! streamed responses) posts an `IoMessage` into the thread's channel and
//! bumps its eventfd, which the thread always has a read outstanding on.
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::trace;

use crate::config::Config;
use crate::message::{Request, Response};

/// Everything known about a connection when it is admitted, apart from the
/// socket itself.
#[derive(Clone, Debug)]
pub(crate) struct Peer {
    pub identity: u64,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    /// Remote IP. Key for admission counters.
    pub ip: String,
    /// Remote IP, or host name if reverse lookup is on.
    pub address: String,
    pub quiet: bool,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub config: Arc<Config>,
}

/// A freshly admitted connection, on its way to an IOThread.
pub(crate) struct Incoming {
    pub stream: std::net::TcpStream,
    pub peer: Peer,
}

pub(crate) enum IoMessage {
    Adopt(Box<Incoming>),

    /// A worker or a deferred completion finished a response.
    Completed {
        slot: usize,
        identity: u64,
        response: Response,
    },

    /// An incremental processing step is done; the request comes back so
    /// more body can be appended.
    Partial {
        slot: usize,
        identity: u64,
        request: Request,
    },

    StreamData {
        slot: usize,
        identity: u64,
        data: Vec<u8>,
    },

    StreamEnd {
        slot: usize,
        identity: u64,
    },

    /// Close every connection and exit the loop.
    Shutdown,
}

/// eventfd used to kick a ring out of `submit_and_wait`.
#[derive(Clone, Debug)]
pub(crate) struct Wakeup(Arc<EventFd>);

impl Wakeup {
    pub fn new() -> std::io::Result<Self> {
        // Blocking on purpose: io_uring polls it for us.
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)?;
        Ok(Self(Arc::new(fd)))
    }

    pub fn wake(&self) {
        if let Err(e) = self.0.write(1) {
            trace!("eventfd write: {e}");
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Mailbox {
    tx: Sender<IoMessage>,
    wakeup: Wakeup,
}

impl Mailbox {
    pub fn new(tx: Sender<IoMessage>, wakeup: Wakeup) -> Self {
        Self { tx, wakeup }
    }

    /// Returns false if the thread is gone.
    pub fn send(&self, msg: IoMessage) -> bool {
        if self.tx.send(msg).is_err() {
            return false;
        }
        self.wakeup.wake();
        true
    }
}

/// Where a response has to go back to.
#[derive(Clone)]
pub(crate) struct Origin {
    pub mailbox: Mailbox,
    pub slot: usize,
    pub identity: u64,
    /// Cleared by the IOThread when the connection closes.
    pub alive: Arc<AtomicBool>,
}

impl Origin {
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Origin(slot={} id={} alive={})",
            self.slot,
            self.identity,
            self.alive()
        )
    }
}

impl std::fmt::Debug for IoMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IoMessage::Adopt(i) => {
                write!(f, "Adopt(id={} from {})", i.peer.identity, i.peer.remote)
            }
            IoMessage::Completed { slot, identity, .. } => {
                write!(f, "Completed(slot={slot} id={identity})")
            }
            IoMessage::Partial { slot, identity, .. } => {
                write!(f, "Partial(slot={slot} id={identity})")
            }
            IoMessage::StreamData {
                slot,
                identity,
                data,
            } => write!(f, "StreamData(slot={slot} id={identity} {}B)", data.len()),
            IoMessage::StreamEnd { slot, identity } => {
                write!(f, "StreamEnd(slot={slot} id={identity})")
            }
            IoMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}
