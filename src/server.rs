//! The administrative surface.
//!
//! A `Server` owns the running threads. Everything else, settings included,
//! is reachable through a `ServerHandle`, which is cheap to clone and is
//! what delegate callbacks get.
use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::access::AccessControl;
use crate::admission::{Admission, Counts, Limits};
use crate::auth::{AuthFailureTracker, BanPolicy};
use crate::config::Config;
use crate::delegate::Delegate;
use crate::error::{Error, Result};
use crate::io_thread::{self, IoThreadHandle, SLOTS_UNLIMITED};
use crate::listener::{Listener, Target};
use crate::mailbox::{IoMessage, Wakeup};
use crate::message::Response;
use crate::tls::TlsSettings;
use crate::worker::WorkerPool;

/// Default connection idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of connections each IOThread keeps alive between
/// requests.
pub const DEFAULT_MAX_KEEPALIVE: usize = 100;

pub const DEFAULT_IO_THREADS: usize = 1;
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default period of the timeout sweep.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

// Thread settings. Fixed while running.
#[derive(Clone, Debug)]
struct Threads {
    io_threads: usize,
    pool_size: usize,
    tick: Duration,
    cpu_affinity: bool,
}

pub(crate) struct Shared {
    config: RwLock<Arc<Config>>,
    pub admission: Admission,
    auth: Mutex<AuthFailureTracker>,
    access: RwLock<Arc<AccessControl>>,
    pub delegate: Arc<dyn Delegate>,
    idle_timeout_ms: AtomicU64,
    max_keepalive: AtomicUsize,
    threads: Mutex<Threads>,
    running: AtomicBool,
    pub next_identity: AtomicU64,
}

impl Shared {
    // No lock in here is held across anything that can panic half way
    // through an update, so poisoned data is still consistent.
    pub fn auth(&self) -> MutexGuard<'_, AuthFailureTracker> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settings and runtime calls, shareable with any thread.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ServerHandle(running={} connections={})",
            self.is_running(),
            self.shared.admission.connections()
        )
    }
}

impl ServerHandle {
    /// The configuration new connections get.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.shared
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration. Existing connections keep the one they
    /// started with.
    pub fn set_config(&self, config: Config) {
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut guard = self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut config = Config::clone(&guard);
        f(&mut config);
        *guard = Arc::new(config);
    }

    /// Verbose logging of requests and responses. Implies duration logging.
    pub fn set_verbose(&self, on: bool) {
        self.update(|c| {
            c.verbose = on;
            if on {
                c.durations = true;
            }
        });
    }

    pub fn set_durations(&self, on: bool) {
        self.update(|c| c.durations = on);
    }

    /// Reverse DNS lookup of client addresses.
    pub fn set_reverse(&self, on: bool) {
        self.update(|c| c.reverse = on);
    }

    /// Trust `x-forwarded-for` and `x-cert-*` headers from a TLS
    /// terminating proxy.
    pub fn set_secure_proxy(&self, on: bool) {
        self.update(|c| c.secure_proxy = on);
    }

    pub fn set_log_raw_io(&self, on: bool) {
        self.update(|c| c.log_raw_io = on);
    }

    pub fn set_fold_headers(&self, on: bool) {
        self.update(|c| c.fold_headers = on);
    }

    pub fn set_max_body_size(&self, n: usize) {
        self.update(|c| c.max_body_size = n);
    }

    pub fn set_max_request_size(&self, n: usize) {
        self.update(|c| c.max_request_size = n);
    }

    /// Zero means unlimited.
    pub fn set_max_connection_requests(&self, n: usize) {
        self.update(|c| c.max_connection_requests = n);
    }

    /// Zero means unlimited.
    pub fn set_max_connection_duration(&self, d: Duration) {
        self.update(|c| c.max_connection_duration = d);
    }

    pub fn set_permitted_methods<I, S>(&self, methods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods = methods.into_iter().map(Into::into).collect();
        self.update(|c| c.permitted_methods = methods);
    }

    #[must_use]
    pub fn limits(&self) -> Limits {
        self.shared.admission.limits()
    }

    /// Zero means unlimited. Also sets how many connection slots each
    /// IOThread gets, if not yet running.
    pub fn set_max_connections(&self, n: usize) {
        let mut l = self.limits();
        l.max_connections = n;
        self.shared.admission.set_limits(l);
    }

    /// Zero means unlimited.
    pub fn set_max_per_host(&self, n: usize) {
        let mut l = self.limits();
        l.max_per_host = n;
        self.shared.admission.set_limits(l);
    }

    /// At the connection cap, answer new connections with a 503 instead of
    /// leaving them in the backlog.
    pub fn set_reject(&self, on: bool) {
        let mut l = self.limits();
        l.reject = on;
        self.shared.admission.set_limits(l);
    }

    /// Only accept connections from these addresses. None accepts all.
    pub fn set_allowed_hosts<I, S>(&self, hosts: Option<I>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared
            .admission
            .set_allow(hosts.map(|h| h.into_iter().map(Into::into).collect::<HashSet<_>>()));
    }

    /// Addresses left out of logging and load counters.
    pub fn set_quiet_hosts<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared
            .admission
            .set_quiet(hosts.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, d: Duration) {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.shared.idle_timeout_ms.store(ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn max_keepalive(&self) -> usize {
        self.shared.max_keepalive.load(Ordering::Relaxed)
    }

    /// Connections per IOThread allowed to idle between requests. Zero
    /// turns keepalive off.
    pub fn set_max_keepalive(&self, n: usize) {
        self.shared.max_keepalive.store(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ban_policy(&self) -> BanPolicy {
        self.shared.auth().policy()
    }

    pub fn set_ban_policy(&self, policy: BanPolicy) {
        self.shared.auth().set_policy(policy);
    }

    /// Reject requests from `address` with 429 for `duration`. Zero lifts
    /// the block.
    pub fn block(&self, address: &str, duration: Duration) {
        self.shared
            .auth()
            .block(address, duration, std::time::Instant::now());
    }

    #[must_use]
    pub fn access(&self) -> Arc<AccessControl> {
        self.shared
            .access
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_access(&self, access: AccessControl) {
        *self
            .shared
            .access
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(access);
    }

    fn set_threads(&self, f: impl FnOnce(&mut Threads)) -> Result<()> {
        let mut t = self.shared.threads();
        if self.is_running() {
            return Err(Error::Running);
        }
        f(&mut t);
        Ok(())
    }

    /// # Errors
    ///
    /// `Error::Running` if the server is running.
    pub fn set_io_threads(&self, n: usize) -> Result<()> {
        self.set_threads(|t| t.io_threads = n.max(1))
    }

    /// # Errors
    ///
    /// `Error::Running` if the server is running.
    pub fn set_pool_size(&self, n: usize) -> Result<()> {
        self.set_threads(|t| t.pool_size = n.max(1))
    }

    /// How often timeouts are checked.
    ///
    /// # Errors
    ///
    /// `Error::Running` if the server is running.
    pub fn set_tick(&self, d: Duration) -> Result<()> {
        self.set_threads(|t| t.tick = d.max(Duration::from_millis(1)))
    }

    /// Pin IOThread n to CPU n.
    ///
    /// # Errors
    ///
    /// `Error::Running` if the server is running.
    pub fn set_cpu_affinity(&self, on: bool) -> Result<()> {
        self.set_threads(|t| t.cpu_affinity = on)
    }

    pub(crate) fn tick(&self) -> Duration {
        self.shared.threads().tick
    }

    pub(crate) fn cpu_affinity(&self) -> bool {
        self.shared.threads().cpu_affinity
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Current load, as seen from `address`.
    #[must_use]
    pub fn counts(&self, address: &str) -> Counts {
        self.shared.admission.counts(address)
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.admission.connections()
    }

    /// Hand back a response deferred by [`Delegate::process`]. Callable
    /// from any thread.
    ///
    /// Returns false if the client is gone, or the response did not come
    /// from this server.
    pub fn completed(&self, mut response: Response) -> bool {
        let Some(origin) = response.origin.take() else {
            return false;
        };
        if !origin.alive() {
            return false;
        }
        origin.mailbox.send(IoMessage::Completed {
            slot: origin.slot,
            identity: origin.identity,
            response,
        })
    }

    /// Send more of a streamed response. Returns false if the client is
    /// gone.
    pub fn stream_data(&self, response: &Response, data: impl Into<Vec<u8>>) -> bool {
        let Some(origin) = response.origin.as_ref() else {
            return false;
        };
        origin.alive()
            && origin.mailbox.send(IoMessage::StreamData {
                slot: origin.slot,
                identity: origin.identity,
                data: data.into(),
            })
    }

    /// End a streamed response.
    pub fn stream_end(&self, response: &Response) -> bool {
        let Some(origin) = response.origin.as_ref() else {
            return false;
        };
        origin.alive()
            && origin.mailbox.send(IoMessage::StreamEnd {
                slot: origin.slot,
                identity: origin.identity,
            })
    }

    /// Tell the delegate something is wrong.
    pub fn alert(&self, message: &str) {
        tracing::error!("{message}");
        self.shared.delegate.alert(message, self);
    }
}

struct Running {
    listener: Option<Listener>,
    listener_wakeup: Wakeup,
    threads: Vec<IoThreadHandle>,
    workers: WorkerPool,
}

impl Running {
    fn start(server: &ServerHandle) -> Result<Self> {
        let threads = server.shared.threads().clone();
        let max = server.limits().max_connections;
        let slots = if max == 0 { SLOTS_UNLIMITED } else { max };
        let listener_wakeup = Wakeup::new()?;
        let workers = WorkerPool::start(threads.pool_size, server)?;
        let jobs = workers.sender().ok_or(Error::Shutdown)?;
        let mut io = Vec::with_capacity(threads.io_threads);
        for n in 0..threads.io_threads {
            // On error, what was started so far is torn down on drop.
            io.push(io_thread::spawn(
                n,
                slots,
                server.clone(),
                jobs.clone(),
                listener_wakeup.clone(),
            )?);
        }
        Ok(Self {
            listener: None,
            listener_wakeup,
            threads: io,
            workers,
        })
    }

    fn targets(&self) -> Vec<Target> {
        self.threads
            .iter()
            .map(|t| Target {
                mailbox: t.mailbox.clone(),
                load: t.load.clone(),
            })
            .collect()
    }

    fn shutdown(&mut self) {
        if let Some(mut l) = self.listener.take() {
            l.stop();
        }
        for t in &mut self.threads {
            t.shutdown();
        }
        self.threads.clear();
        self.workers.shutdown();
    }
}

/// An embeddable HTTP/HTTPS server.
///
/// Dropping it shuts it down.
pub struct Server {
    handle: ServerHandle,
    running: Mutex<Option<Running>>,
}

impl std::ops::Deref for Server {
    type Target = ServerHandle;
    fn deref(&self) -> &ServerHandle {
        &self.handle
    }
}

impl Server {
    #[must_use]
    pub fn new(delegate: impl Delegate) -> Self {
        Self::with_delegate(Arc::new(delegate))
    }

    #[must_use]
    pub fn with_delegate(delegate: Arc<dyn Delegate>) -> Self {
        let shared = Shared {
            config: RwLock::new(Arc::new(Config::default())),
            admission: Admission::new(Limits::default()),
            auth: Mutex::new(AuthFailureTracker::new(BanPolicy::default())),
            access: RwLock::new(Arc::new(AccessControl::new())),
            delegate,
            idle_timeout_ms: AtomicU64::new(
                u64::try_from(DEFAULT_IDLE_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            ),
            max_keepalive: AtomicUsize::new(DEFAULT_MAX_KEEPALIVE),
            threads: Mutex::new(Threads {
                io_threads: DEFAULT_IO_THREADS,
                pool_size: DEFAULT_POOL_SIZE,
                tick: DEFAULT_TICK,
                cpu_affinity: false,
            }),
            running: AtomicBool::new(false),
            next_identity: AtomicU64::new(0),
        };
        Self {
            handle: ServerHandle {
                shared: Arc::new(shared),
            },
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start listening on `addr`, starting the server if needed.
    ///
    /// If already listening, the old listening socket is replaced once the
    /// new one is bound. On error nothing changes.
    ///
    /// # Errors
    ///
    /// Bad address, bind failure, or failure starting threads.
    pub fn listen(&self, addr: &str, tls: TlsSettings) -> Result<SocketAddr> {
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|_| Error::BadAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| Error::BadAddress(addr.to_string()))?;
        let socket = TcpListener::bind(sockaddr).map_err(|source| Error::Bind {
            addr: sockaddr,
            source,
        })?;

        let mut running = self.lock();
        let mut fresh = None;
        let r = match running.as_mut() {
            Some(r) => r,
            None => {
                // Counts as running from here, so thread settings can't
                // change under us.
                let guard = self.shared.threads();
                self.shared.running.store(true, Ordering::Release);
                drop(guard);
                match Running::start(&self.handle) {
                    Ok(r) => fresh.insert(r),
                    Err(e) => {
                        self.shared.running.store(false, Ordering::Release);
                        return Err(e);
                    }
                }
            }
        };
        let listener = match Listener::start(
            socket,
            tls,
            r.targets(),
            r.listener_wakeup.clone(),
            self.handle.clone(),
        ) {
            Ok(l) => l,
            Err(e) => {
                if let Some(mut r) = fresh {
                    r.shutdown();
                    self.shared.running.store(false, Ordering::Release);
                }
                return Err(e);
            }
        };
        let local = listener.local_addr();
        if let Some(mut old) = r.listener.replace(listener) {
            debug!("Replacing listener on {}", old.local_addr());
            old.stop();
        }
        if let Some(r) = fresh {
            *running = Some(r);
        }
        info!("Server listening on {local}");
        Ok(local)
    }

    /// Where the server is listening, if it is.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .as_ref()
            .and_then(|r| r.listener.as_ref())
            .map(Listener::local_addr)
    }

    /// Stop accepting new connections. Existing ones run to completion or
    /// timeout.
    pub fn close_listener(&self) {
        if let Some(mut l) = self.lock().as_mut().and_then(|r| r.listener.take()) {
            l.stop();
        }
    }

    /// Stop listening, close every connection, and stop all threads.
    pub fn shutdown(&self) {
        let Some(mut r) = self.lock().take() else {
            return;
        };
        info!("Shutting down");
        r.shutdown();
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;

    struct Nop;

    impl Delegate for Nop {
        fn process(
            &self,
            _request: &Request,
            _response: &mut Response,
            _server: &ServerHandle,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn setters_replace_config() {
        let server = Server::new(Nop);
        let before = server.config();
        server.set_verbose(true);
        server.set_max_body_size(10);
        server.set_permitted_methods(["GET"]);
        let after = server.config();
        assert!(!before.verbose);
        assert!(after.verbose);
        assert!(after.durations);
        assert_eq!(after.max_body_size, 10);
        assert!(after.permits("GET"));
        assert!(!after.permits("POST"));
        // The old snapshot is untouched.
        assert_eq!(before.max_body_size, crate::config::DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    fn limits_setters() {
        let server = Server::new(Nop);
        server.set_max_connections(1);
        server.set_max_per_host(0);
        server.set_reject(true);
        assert_eq!(
            server.limits(),
            Limits {
                max_connections: 1,
                max_per_host: 0,
                reject: true
            }
        );
    }

    #[test]
    fn bad_address() {
        let server = Server::new(Nop);
        assert!(matches!(
            server.listen("not an address", TlsSettings::none()),
            Err(Error::BadAddress(_))
        ));
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn thread_settings_only_while_stopped() {
        let server = Server::new(Nop);
        server.set_io_threads(2).unwrap();
        server.set_pool_size(0).unwrap();
        server.shared.running.store(true, Ordering::Release);
        assert!(matches!(server.set_io_threads(3), Err(Error::Running)));
        server.shared.running.store(false, Ordering::Release);
        assert_eq!(server.shared.threads().io_threads, 2);
        assert_eq!(server.shared.threads().pool_size, 1);
    }

    #[test]
    fn completing_foreign_response_fails() {
        let server = Server::new(Nop);
        let r = Response::new();
        assert!(!server.stream_data(&r, "x"));
        assert!(!server.stream_end(&r));
        assert!(!server.completed(r));
    }
}
