//! IOThread: one io_uring, and the connections it owns.
//!
//! Every socket operation is an SQE whose user data carries the slot
//! number and the operation kind. Completions are fed to the slot's
//! `Connection`, which says what to do next.
//!
//! Connection slots are allocated up front, so buffers handed to the kernel
//! never move. A closed slot is only reused once every op submitted for it
//! has completed.
use std::net::TcpStream;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use crossbeam_channel::{Receiver, Sender};
use rtsan_standalone::nonblocking;
use tracing::{debug, error, info, trace, warn};

use crate::access::Access;
use crate::activity::{Activity, ActivityLists};
use crate::admission::Counts;
use crate::connection::{Connection, Host, Next, State};
use crate::error::Result;
use crate::listener;
use crate::mailbox::{Incoming, IoMessage, Mailbox, Origin, Wakeup};
use crate::message::{Request, Response};
use crate::server::ServerHandle;
use crate::worker::Job;

// 10MiB stack size per thread.
pub(crate) const THREAD_STACK_SIZE: usize = 10 * 1_048_576;

pub(crate) const RING_SIZE: u32 = 1024;

// Slots per thread when the connection count is unlimited.
pub(crate) const SLOTS_UNLIMITED: usize = 1024;

// Max mailbox messages handled per loop iteration, so that a flood of
// stream data doesn't starve socket completions.
const MAILBOX_BATCH: usize = 256;

// Every io_uring op has a "handle" of sorts. We use it to stuff the slot
// number, and the operation.
const USER_DATA_CON_MASK: u64 = 0xffff_ffff;

// Special user data "handle" to indicate timeout. At timeout, we sweep.
const USER_DATA_TIMEOUT: u64 = u64::MAX - 1;

// Special user data "handle" for the mailbox eventfd.
const USER_DATA_WAKEUP: u64 = u64::MAX - 2;

const USER_DATA_OP_MASK: u64 = 0xff_0000_0000;
const USER_DATA_OP_READ: u64 = 0x1_0000_0000;
const USER_DATA_OP_WRITE: u64 = 0x2_0000_0000;
const USER_DATA_OP_CLOSE: u64 = 0x3_0000_0000;
const USER_DATA_OP_CANCEL: u64 = 0x4_0000_0000;
const USER_DATA_OP_RETRY: u64 = 0x5_0000_0000;

// TODO: panics if squeue is full. There's a better way, surely.
pub(crate) type SQueue = ArrayVec<io_uring::squeue::Entry, 10_000>;

#[derive(Debug, PartialEq)]
enum UserDataOp {
    Read,
    Write,
    Close,
    Cancel,
    Retry,
}

#[nonblocking]
fn decode_user_data(user_data: u64) -> Option<(usize, UserDataOp)> {
    let op = match user_data & USER_DATA_OP_MASK {
        USER_DATA_OP_READ => UserDataOp::Read,
        USER_DATA_OP_WRITE => UserDataOp::Write,
        USER_DATA_OP_CLOSE => UserDataOp::Close,
        USER_DATA_OP_CANCEL => UserDataOp::Cancel,
        USER_DATA_OP_RETRY => UserDataOp::Retry,
        _ => return None,
    };
    if user_data & !(USER_DATA_CON_MASK | USER_DATA_OP_MASK) != 0 {
        return None;
    }
    Some(((user_data & USER_DATA_CON_MASK) as usize, op))
}

#[must_use]
pub(crate) fn make_op_timeout(
    ts: &io_uring::types::Timespec,
    user_data: u64,
) -> io_uring::squeue::Entry {
    io_uring::opcode::Timeout::new(std::ptr::from_ref(ts))
        .build()
        .user_data(user_data)
}

#[must_use]
pub(crate) fn make_op_wakeup(
    fd: libc::c_int,
    buf: &mut [u8; 8],
    user_data: u64,
) -> io_uring::squeue::Entry {
    io_uring::opcode::Read::new(io_uring::types::Fd(fd), buf.as_mut_ptr(), 8)
        .build()
        .user_data(user_data)
}

/// A connection slot, and the ring side bookkeeping for it.
struct Slot {
    con: Connection,
    stream: Option<TcpStream>,

    // Ops submitted and not yet completed.
    outstanding: usize,

    // User data of the read, write or retry timer in flight, for cancelling.
    in_flight: Option<u64>,

    // Handshake retry delay. Referenced by the kernel while the timer runs.
    retry_ts: io_uring::types::Timespec,
}

struct PoolTracker {
    free: Vec<usize>,
}

impl PoolTracker {
    #[must_use]
    fn new(n: usize) -> Self {
        Self {
            free: (0..n).rev().collect(),
        }
    }
    #[must_use]
    fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }
    fn dealloc(&mut self, n: usize) {
        self.free.push(n);
    }
    #[must_use]
    fn free(&self) -> usize {
        self.free.len()
    }
}

/// What a Connection sees of the server, from this thread.
struct ThreadHost<'a> {
    server: &'a ServerHandle,
    now: Instant,
    keepalive: usize,
    max_keepalive: usize,
}

impl<'a> ThreadHost<'a> {
    fn new(server: &'a ServerHandle, lists: &ActivityLists, now: Instant) -> Self {
        Self {
            server,
            now,
            keepalive: lists.len(Activity::Keepalive),
            max_keepalive: server.max_keepalive(),
        }
    }
}

impl Host for ThreadHost<'_> {
    fn now(&self) -> Instant {
        self.now
    }
    fn counts(&self, ip: &str) -> Counts {
        self.server.shared.admission.counts(ip)
    }
    fn request_started(&mut self) {
        self.server.shared.admission.request_started();
    }
    fn request_finished(&mut self) {
        self.server.shared.admission.request_finished();
    }
    fn banned(&mut self, address: &str) -> bool {
        self.server.shared.auth().check(address, self.now)
    }
    fn auth_failed(&mut self, address: &str) {
        self.server.shared.auth().record_failure(address, self.now);
    }
    fn block(&mut self, address: &str, duration: Duration) {
        self.server.shared.auth().block(address, duration, self.now);
    }
    fn access(&self, path: &str, username: Option<&str>, password: Option<&str>) -> Access {
        self.server.access().check(path, username, password)
    }
    fn incremental(&self, request: &Request) -> usize {
        self.server.shared.delegate.incremental(request, self.server)
    }
    fn keepalive_available(&self) -> bool {
        self.keepalive < self.max_keepalive
    }
    fn debug(&self, message: &str) {
        self.server.shared.delegate.debug(message, self.server);
    }
    fn audit(&self, message: &str) {
        self.server.shared.delegate.audit(message, self.server);
    }
}

/// The server's handle on a running IOThread.
pub(crate) struct IoThreadHandle {
    pub mailbox: Mailbox,

    /// Connections currently assigned to the thread.
    pub load: Arc<AtomicUsize>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl IoThreadHandle {
    /// Close every connection, and wait for the thread to exit.
    pub fn shutdown(&mut self) {
        self.mailbox.send(IoMessage::Shutdown);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!("IOThread panicked");
            }
        }
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start IOThread number `n`.
///
/// # Errors
///
/// Ring or eventfd setup failure, or failure to spawn the thread.
pub(crate) fn spawn(
    n: usize,
    slots: usize,
    server: ServerHandle,
    jobs: Sender<Job>,
    listener_wakeup: Wakeup,
) -> Result<IoThreadHandle> {
    let ring = io_uring::IoUring::builder().dontfork().build(RING_SIZE)?;
    let wakeup = Wakeup::new()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mailbox = Mailbox::new(tx, wakeup.clone());
    let load = Arc::new(AtomicUsize::new(0));
    let cpu_affinity = server.cpu_affinity();
    let thread_mailbox = mailbox.clone();
    let thread_load = load.clone();
    let handle = std::thread::Builder::new()
        .name(format!("io/{n}"))
        .stack_size(THREAD_STACK_SIZE)
        .spawn(move || {
            if cpu_affinity {
                // Set affinity mapping 1:1.
                if !core_affinity::set_for_current(core_affinity::CoreId { id: n }) {
                    error!("Failed to bind thread {n} to core {n}");
                }
            }
            // Built here, not by the caller: the submission queue alone is
            // bigger than a default thread stack.
            let thread = IoThread::new(
                n,
                slots,
                rx,
                thread_mailbox,
                wakeup,
                server,
                jobs,
                listener_wakeup,
                thread_load,
            );
            info!("Running IOThread {n}");
            if let Err(e) = mainloop(ring, thread) {
                error!("IOThread {n} failed: {e}");
            }
            info!("Exiting IOThread {n}");
        })?;
    Ok(IoThreadHandle {
        mailbox,
        load,
        handle: Some(handle),
    })
}

struct IoThread {
    n: usize,
    rx: Receiver<IoMessage>,
    mailbox: Mailbox,
    wakeup: Wakeup,

    // Kernel writes into these, so they must not move.
    wake_buf: Box<[u8; 8]>,
    tick_ts: Box<io_uring::types::Timespec>,

    // Never resized.
    slots: Vec<Slot>,
    pool: PoolTracker,
    lists: ActivityLists,
    ops: SQueue,
    server: ServerHandle,
    jobs: Sender<Job>,
    listener_wakeup: Wakeup,
    load: Arc<AtomicUsize>,
    shutting_down: bool,
}

impl IoThread {
    #[allow(clippy::too_many_arguments)]
    fn new(
        n: usize,
        slots: usize,
        rx: Receiver<IoMessage>,
        mailbox: Mailbox,
        wakeup: Wakeup,
        server: ServerHandle,
        jobs: Sender<Job>,
        listener_wakeup: Wakeup,
        load: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            n,
            rx,
            mailbox,
            wakeup,
            wake_buf: Box::new([0; 8]),
            tick_ts: Box::new(server.tick().into()),
            slots: (0..slots)
                .map(|id| Slot {
                    con: Connection::new(id),
                    stream: None,
                    outstanding: 0,
                    in_flight: None,
                    retry_ts: io_uring::types::Timespec::new(),
                })
                .collect(),
            pool: PoolTracker::new(slots),
            lists: ActivityLists::new(slots),
            ops: ArrayVec::new(),
            server,
            jobs,
            listener_wakeup,
            load,
            shutting_down: false,
        }
    }
}

fn mainloop(mut ring: io_uring::IoUring, mut t: IoThread) -> std::io::Result<()> {
    t.ops.push(make_op_timeout(&t.tick_ts, USER_DATA_TIMEOUT));
    let fd = t.wakeup.raw_fd();
    t.ops.push(make_op_wakeup(fd, &mut t.wake_buf, USER_DATA_WAKEUP));
    loop {
        if t.shutting_down && t.pool.free() == t.slots.len() {
            debug!("IOThread {} drained", t.n);
            return Ok(());
        }
        t.submit(&mut ring)?;
        let mut cq = ring.completion();
        if cq.overflow() != 0 {
            warn!("Completion queue overflow: {}", cq.overflow());
        }
        cq.sync();
        if cq.is_empty() {
            drop(cq);
            // Nothing has completed, so submit anything pending, and sleep.
            if let Err(ref e) = ring.submit_and_wait(1) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    debug!("Interrupted system call for submit_and_wait");
                } else {
                    warn!("io_uring submit_and_wait(): {e}");
                }
            }
            continue;
        }
        for cqe in cq {
            let user_data = cqe.user_data();
            let result = cqe.result();
            match user_data {
                USER_DATA_TIMEOUT => {
                    t.sweep(Instant::now());
                    t.ops.push(make_op_timeout(&t.tick_ts, USER_DATA_TIMEOUT));
                }
                USER_DATA_WAKEUP => {
                    if result < 0 {
                        warn!(
                            "eventfd read: {}",
                            std::io::Error::from_raw_os_error(result.abs())
                        );
                    }
                    t.drain_mailbox();
                    t.ops.push(make_op_wakeup(fd, &mut t.wake_buf, USER_DATA_WAKEUP));
                }
                _ => t.op_completion(user_data, result),
            }
        }
    }
}

impl IoThread {
    fn submit(&mut self, ring: &mut io_uring::IoUring) -> std::io::Result<()> {
        let mut sq = ring.submission();
        let to_push = std::cmp::min(sq.capacity() - sq.len(), self.ops.len());
        if to_push > 0 {
            // SAFETY: every buffer and timespec referenced by the ops lives
            // in a slot or box that outlives the op.
            let res = unsafe { sq.push_multiple(&self.ops[..to_push]) };
            if res.is_err() {
                // Can't happen: we checked for room.
                error!("Submission queue full");
                return Ok(());
            }
            self.ops.drain(..to_push);
            drop(sq);
            ring.submit()?;
        }
        Ok(())
    }

    fn op_completion(&mut self, user_data: u64, result: i32) {
        let Some((slot, op)) = decode_user_data(user_data) else {
            error!("Invalid user data {user_data:x} result {result}");
            return;
        };
        let Some(s) = self.slots.get_mut(slot) else {
            error!("Completion for nonexistent slot {slot}");
            return;
        };
        s.outstanding = s.outstanding.saturating_sub(1);
        if s.in_flight == Some(user_data) {
            s.in_flight = None;
        }
        let span = tracing::trace_span!(
            "conn",
            id = s.con.identity,
            slot,
            outstanding = s.outstanding,
            state = s.con.state().name()
        );
        let _guard = span.enter();
        trace!("Op {op:?} result {result}");
        if s.con.state() == State::Closed {
            self.maybe_free(slot);
            return;
        }
        let res = if result < 0 {
            Err(std::io::Error::from_raw_os_error(result.abs()))
        } else {
            Ok(usize::try_from(result).unwrap_or(0))
        };
        let now = Instant::now();
        let mut host = ThreadHost::new(&self.server, &self.lists, now);
        let next = match op {
            UserDataOp::Read => self.slots[slot].con.on_read(res, &mut host),
            UserDataOp::Write => self.slots[slot].con.on_written(res, &mut host),
            UserDataOp::Retry => self.slots[slot].con.on_retry(),
            UserDataOp::Close | UserDataOp::Cancel => {
                // Only submitted when closing.
                return;
            }
        };
        self.apply(slot, next, now);
    }

    /// Do what the connection asked for.
    fn apply(&mut self, slot: usize, next: Next, now: Instant) {
        let id = slot as u64;
        let s = &mut self.slots[slot];
        let fd = s.stream.as_ref().map(AsRawFd::as_raw_fd);
        match next {
            Next::Read => {
                let Some(fd) = fd else {
                    return self.close(slot);
                };
                let buf = s.con.read_target();
                let ud = id | USER_DATA_OP_READ;
                self.ops.push(
                    io_uring::opcode::Recv::new(
                        io_uring::types::Fd(fd),
                        buf.as_mut_ptr(),
                        u32::try_from(buf.len()).unwrap_or(u32::MAX),
                    )
                    .build()
                    .user_data(ud),
                );
                s.outstanding += 1;
                s.in_flight = Some(ud);
            }
            Next::Write => {
                let Some(fd) = fd else {
                    return self.close(slot);
                };
                let buf = s.con.write_source();
                let ud = id | USER_DATA_OP_WRITE;
                self.ops.push(
                    io_uring::opcode::Send::new(
                        io_uring::types::Fd(fd),
                        buf.as_ptr(),
                        u32::try_from(buf.len()).unwrap_or(u32::MAX),
                    )
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
                    .user_data(ud),
                );
                s.outstanding += 1;
                s.in_flight = Some(ud);
            }
            Next::Retry(delay) => {
                s.retry_ts = delay.into();
                let ud = id | USER_DATA_OP_RETRY;
                self.ops.push(make_op_timeout(&s.retry_ts, ud));
                s.outstanding += 1;
                s.in_flight = Some(ud);
            }
            Next::Dispatch(request) => return self.dispatch(slot, request, now),
            Next::Wait => {}
            Next::Close => return self.close(slot),
        }
        self.touch(slot, now);
    }

    // Move to the tail of the list for the connection's current activity.
    fn touch(&mut self, slot: usize, now: Instant) {
        let con = &mut self.slots[slot].con;
        if now > con.tick {
            con.tick = now;
        }
        match con.activity() {
            Some(class) => self.lists.touch(slot, class),
            None => self.lists.remove(slot),
        }
    }

    fn dispatch(&mut self, slot: usize, request: Request, now: Instant) {
        let con = &self.slots[slot].con;
        let origin = Origin {
            mailbox: self.mailbox.clone(),
            slot,
            identity: con.identity,
            alive: con.alive_flag(),
        };
        trace!(
            "Dispatching {} {} from {}",
            request.method(),
            request.path(),
            con.identity
        );
        self.touch(slot, now);
        if self.jobs.send(Job { request, origin }).is_err() {
            error!("Worker pool is gone");
            let mut response = Response::error(500);
            response.set_close(true);
            let mut host = ThreadHost::new(&self.server, &self.lists, now);
            let next = self.slots[slot].con.on_response(response, &mut host);
            self.apply(slot, next, now);
        }
    }

    /// Start closing a connection. The slot is freed once all its ops are
    /// done.
    fn close(&mut self, slot: usize) {
        self.lists.remove(slot);
        let id = slot as u64;
        let s = &mut self.slots[slot];
        if matches!(s.con.state(), State::Closed | State::Vacant) {
            return;
        }
        trace!("Closing connection {} in {}", s.con.identity, s.con.state().name());
        if let Some(ud) = s.in_flight.take() {
            self.ops.push(
                io_uring::opcode::AsyncCancel::new(ud)
                    .build()
                    .user_data(id | USER_DATA_OP_CANCEL),
            );
            s.outstanding += 1;
        }
        if let Some(stream) = s.stream.take() {
            self.ops.push(
                io_uring::opcode::Close::new(io_uring::types::Fd(stream.into_raw_fd()))
                    .build()
                    .user_data(id | USER_DATA_OP_CLOSE),
            );
            s.outstanding += 1;
        }
        let mut host = ThreadHost::new(&self.server, &self.lists, Instant::now());
        s.con.closed(&mut host);
        if self.server.shared.admission.release(s.con.ip()) {
            self.listener_wakeup.wake();
        }
        self.maybe_free(slot);
    }

    fn maybe_free(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        if s.outstanding > 0 || s.con.state() != State::Closed {
            return;
        }
        trace!("Freeing slot {slot}");
        s.con.deinit();
        s.in_flight = None;
        self.pool.dealloc(slot);
        self.load.fetch_sub(1, Ordering::Relaxed);
    }

    fn sweep(&mut self, now: Instant) {
        let idle = self.server.idle_timeout();
        for class in Activity::ALL {
            if class == Activity::Keepalive {
                let expired: Vec<usize> = self
                    .lists
                    .iter(class)
                    .filter(|&slot| self.slots[slot].con.expired(now, idle))
                    .collect();
                for slot in expired {
                    self.time_out(slot, class, now);
                }
                continue;
            }
            while let Some(slot) = self.lists.front(class) {
                if !self.slots[slot].con.expired(now, idle) {
                    break;
                }
                self.time_out(slot, class, now);
            }
        }
        trace!(
            "Tick: handshake={} readwrite={} processing={} keepalive={} free={}",
            self.lists.len(Activity::Handshake),
            self.lists.len(Activity::ReadWrite),
            self.lists.len(Activity::Processing),
            self.lists.len(Activity::Keepalive),
            self.pool.free()
        );
    }

    fn time_out(&mut self, slot: usize, class: Activity, now: Instant) {
        let con = &self.slots[slot].con;
        debug!(
            "Connection {} timed out in {} after {:?}",
            con.identity,
            class.name(),
            now.saturating_duration_since(con.tick)
        );
        self.close(slot);
    }

    fn drain_mailbox(&mut self) {
        for _ in 0..MAILBOX_BATCH {
            match self.rx.try_recv() {
                Ok(msg) => self.handle_message(msg),
                Err(crossbeam_channel::TryRecvError::Empty) => return,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    self.shutdown();
                    return;
                }
            }
        }
        if !self.rx.is_empty() {
            // Come back for the rest after handling some I/O.
            self.wakeup.wake();
        }
    }

    // The connection a message is for, if it is still around.
    fn target(&self, slot: usize, identity: u64) -> Option<usize> {
        let s = self.slots.get(slot)?;
        if s.con.identity != identity || matches!(s.con.state(), State::Vacant | State::Closed) {
            trace!("Message for gone connection {identity}");
            return None;
        }
        Some(slot)
    }

    fn handle_message(&mut self, msg: IoMessage) {
        trace!("Message: {msg:?}");
        let now = Instant::now();
        match msg {
            IoMessage::Adopt(incoming) => self.adopt(*incoming, now),
            IoMessage::Completed {
                slot,
                identity,
                response,
            } => {
                if let Some(slot) = self.target(slot, identity) {
                    let mut host = ThreadHost::new(&self.server, &self.lists, now);
                    let next = self.slots[slot].con.on_response(response, &mut host);
                    self.apply(slot, next, now);
                }
            }
            IoMessage::Partial {
                slot,
                identity,
                request,
            } => {
                if let Some(slot) = self.target(slot, identity) {
                    let mut host = ThreadHost::new(&self.server, &self.lists, now);
                    let next = self.slots[slot].con.on_partial(request, &mut host);
                    self.apply(slot, next, now);
                }
            }
            IoMessage::StreamData {
                slot,
                identity,
                data,
            } => {
                if let Some(slot) = self.target(slot, identity) {
                    let next = self.slots[slot].con.on_stream_data(&data);
                    self.apply(slot, next, now);
                }
            }
            IoMessage::StreamEnd { slot, identity } => {
                if let Some(slot) = self.target(slot, identity) {
                    let mut host = ThreadHost::new(&self.server, &self.lists, now);
                    let next = self.slots[slot].con.on_stream_end(&mut host);
                    self.apply(slot, next, now);
                }
            }
            IoMessage::Shutdown => self.shutdown(),
        }
    }

    fn adopt(&mut self, incoming: Incoming, now: Instant) {
        let Incoming { stream, peer } = incoming;
        let admission = &self.server.shared.admission;
        if self.shutting_down {
            admission.release(&peer.ip);
            self.load.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let Some(slot) = self.pool.alloc() else {
            warn!("IOThread {} out of connection slots", self.n);
            listener::reject(stream, 503, peer.tls.is_some());
            if admission.release(&peer.ip) {
                self.listener_wakeup.wake();
            }
            self.load.fetch_sub(1, Ordering::Relaxed);
            return;
        };
        let ip = peer.ip.clone();
        let s = &mut self.slots[slot];
        s.stream = Some(stream);
        match s.con.init(peer, now) {
            Ok(next) => {
                if !s.con.quiet() {
                    debug!("Connection {} from {ip} in slot {slot}", s.con.identity);
                }
                self.apply(slot, next, now);
            }
            Err(e) => {
                warn!("TLS setup for {ip}: {e}");
                s.stream = None;
                self.pool.dealloc(slot);
                if admission.release(&ip) {
                    self.listener_wakeup.wake();
                }
                self.load.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        debug!("IOThread {} shutting down", self.n);
        self.shutting_down = true;
        for slot in 0..self.slots.len() {
            self.close(slot);
        }
    }
}
