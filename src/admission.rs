//! Connection admission control and global load counters.
//!
//! All IOThreads and the listener share one `Admission`. Everything that
//! decides whether a connection may be admitted lives behind one mutex, so
//! decisions see a consistent view of the counters.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::trace;

/// Default cap on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 128;

/// Default cap on concurrent connections from a single host.
pub const DEFAULT_MAX_PER_HOST: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Zero means unlimited.
    pub max_connections: usize,

    /// Zero means unlimited.
    pub max_per_host: usize,

    /// When at `max_connections`, answer new connections with a 503
    /// instead of leaving them in the listen backlog.
    pub reject: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_per_host: DEFAULT_MAX_PER_HOST,
            reject: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Admit,

    /// Not on the allow-list. 403.
    Forbidden,

    /// At the global cap. 503.
    Full,

    /// At the per-host cap. 503.
    HostFull,
}

/// Point in time load figures, as put in `x-count-*` request headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: usize,
    pub connections: usize,
    pub hosts: usize,
    pub host_connections: usize,
}

#[derive(Debug, Default)]
struct Host {
    connections: usize,
    quiet: bool,
}

#[derive(Debug, Default)]
struct State {
    limits: Limits,
    allow: Option<HashSet<String>>,
    quiet: HashSet<String>,
    total: usize,
    requests: usize,
    hosts: HashMap<String, Host>,
}

#[derive(Debug, Default)]
pub struct Admission {
    state: Mutex<State>,
}

impl Admission {
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            state: Mutex::new(State {
                limits,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Nothing in here can panic half way through an update, so a
        // poisoned lock still holds consistent data.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn limits(&self) -> Limits {
        self.lock().limits.clone()
    }

    pub fn set_limits(&self, limits: Limits) {
        self.lock().limits = limits;
    }

    /// Only these addresses may connect. None allows everyone.
    pub fn set_allow(&self, allow: Option<HashSet<String>>) {
        self.lock().allow = allow;
    }

    /// Addresses that are neither logged nor counted in statistics.
    pub fn set_quiet(&self, quiet: HashSet<String>) {
        self.lock().quiet = quiet;
    }

    #[must_use]
    pub fn is_quiet(&self, address: &str) -> bool {
        self.lock().quiet.contains(address)
    }

    /// True if another connection may be accepted without being rejected.
    #[must_use]
    pub fn has_room(&self) -> bool {
        let s = self.lock();
        s.limits.max_connections == 0 || s.total < s.limits.max_connections
    }

    /// True if the listener should keep accepting connections even at the
    /// cap, so that it can reject them.
    #[must_use]
    pub fn rejecting(&self) -> bool {
        self.lock().limits.reject
    }

    /// Decide on a new connection from `address`, and count it if admitted.
    pub(crate) fn admit(&self, address: &str) -> Decision {
        let mut s = self.lock();
        if let Some(allow) = &s.allow {
            if !allow.contains(address) {
                return Decision::Forbidden;
            }
        }
        if s.limits.max_connections != 0 && s.total >= s.limits.max_connections {
            return Decision::Full;
        }
        let max_per_host = s.limits.max_per_host;
        let current = s.hosts.get(address).map_or(0, |h| h.connections);
        if max_per_host != 0 && current >= max_per_host {
            return Decision::HostFull;
        }
        let quiet = s.quiet.contains(address);
        let host = s.hosts.entry(address.to_string()).or_default();
        host.connections += 1;
        host.quiet = quiet;
        s.total += 1;
        trace!("Admitted {address}, {} connections total", s.total);
        Decision::Admit
    }

    /// Forget a closed connection. Returns true if this took us below the
    /// global cap.
    pub(crate) fn release(&self, address: &str) -> bool {
        let mut s = self.lock();
        let was_full = s.limits.max_connections != 0 && s.total >= s.limits.max_connections;
        s.total = s.total.saturating_sub(1);
        if let Some(h) = s.hosts.get_mut(address) {
            h.connections -= 1;
            if h.connections == 0 {
                s.hosts.remove(address);
            }
        }
        was_full && s.total < s.limits.max_connections
    }

    pub(crate) fn request_started(&self) {
        self.lock().requests += 1;
    }

    pub(crate) fn request_finished(&self) {
        let mut s = self.lock();
        s.requests = s.requests.saturating_sub(1);
    }

    /// Current load. Quiet hosts are left out.
    #[must_use]
    pub fn counts(&self, address: &str) -> Counts {
        let s = self.lock();
        let (quiet_hosts, quiet_connections) = s
            .hosts
            .values()
            .filter(|h| h.quiet)
            .fold((0, 0), |(h, c), host| (h + 1, c + host.connections));
        Counts {
            requests: s.requests,
            connections: s.total - quiet_connections,
            hosts: s.hosts.len() - quiet_hosts,
            host_connections: s
                .hosts
                .get(address)
                .filter(|h| !h.quiet)
                .map_or(0, |h| h.connections),
        }
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.lock().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_connections: usize, max_per_host: usize) -> Limits {
        Limits {
            max_connections,
            max_per_host,
            reject: true,
        }
    }

    #[test]
    fn global_cap() {
        let a = Admission::new(limits(2, 0));
        assert_eq!(a.admit("a"), Decision::Admit);
        assert_eq!(a.admit("b"), Decision::Admit);
        assert!(!a.has_room());
        assert_eq!(a.admit("c"), Decision::Full);
        assert_eq!(a.connections(), 2);
        assert!(a.release("a"));
        assert!(a.has_room());
        assert_eq!(a.admit("c"), Decision::Admit);
    }

    #[test]
    fn per_host_cap() {
        let a = Admission::new(limits(0, 2));
        assert_eq!(a.admit("a"), Decision::Admit);
        assert_eq!(a.admit("a"), Decision::Admit);
        assert_eq!(a.admit("a"), Decision::HostFull);
        assert_eq!(a.admit("b"), Decision::Admit);
        assert!(!a.release("a"));
        assert_eq!(a.admit("a"), Decision::Admit);
    }

    #[test]
    fn caps_hold_under_any_sequence() {
        let a = Admission::new(limits(5, 2));
        let hosts = ["a", "b", "c"];
        let mut live: Vec<&str> = Vec::new();
        for step in 0..200 {
            let h = hosts[step % 3];
            if step % 7 == 0 {
                if let Some(h) = live.pop() {
                    a.release(h);
                }
            } else if a.admit(h) == Decision::Admit {
                live.push(h);
            }
            assert!(a.connections() <= 5);
            for h in hosts {
                assert!(live.iter().filter(|x| **x == h).count() <= 2);
            }
        }
    }

    #[test]
    fn allow_list() {
        let a = Admission::new(Limits::default());
        a.set_allow(Some(["127.0.0.1".to_string()].into_iter().collect()));
        assert_eq!(a.admit("127.0.0.2"), Decision::Forbidden);
        assert_eq!(a.admit("127.0.0.1"), Decision::Admit);
        a.set_allow(None);
        assert_eq!(a.admit("127.0.0.2"), Decision::Admit);
    }

    #[test]
    fn quiet_hosts_not_counted() {
        let a = Admission::new(Limits::default());
        a.set_quiet(["q".to_string()].into_iter().collect());
        assert!(a.is_quiet("q"));
        a.admit("q");
        a.admit("x");
        a.admit("x");
        a.request_started();
        let c = a.counts("x");
        assert_eq!(
            c,
            Counts {
                requests: 1,
                connections: 2,
                hosts: 1,
                host_connections: 2,
            }
        );
        assert_eq!(a.counts("q").host_connections, 0);
        assert_eq!(a.connections(), 3);
    }
}
