//! Throttling of clients that keep failing authentication.
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

/// Ban parameters. The defaults ban on the very first failure, for one
/// second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BanPolicy {
    /// How far back failures are counted.
    pub find_time: Duration,

    /// How long a ban lasts.
    pub ban_time: Duration,

    /// Failures within `find_time` needed to trigger a ban. Zero behaves
    /// like one.
    pub max_retry: usize,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            find_time: Duration::from_secs(1),
            ban_time: Duration::from_secs(1),
            max_retry: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    failures: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.banned_until.is_none()
    }
}

/// Recent authentication failures, per source address.
#[derive(Debug, Default)]
pub struct AuthFailureTracker {
    policy: BanPolicy,
    entries: HashMap<String, Entry>,
}

impl AuthFailureTracker {
    #[must_use]
    pub fn new(policy: BanPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> BanPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: BanPolicy) {
        self.policy = policy;
    }

    // Only the last `max_retry` failures matter, so that's all we keep.
    fn ring_len(&self) -> usize {
        self.policy.max_retry.max(1)
    }

    pub fn record_failure(&mut self, address: &str, now: Instant) {
        let cap = self.ring_len();
        let e = self.entries.entry(address.to_string()).or_default();
        if e.failures.len() == cap {
            e.failures.pop_front();
        }
        e.failures.push_back(now);
        debug!(
            "Authentication failure from {address}, {} recent",
            e.failures.len()
        );
    }

    /// Decide whether a new request from `address` must be throttled.
    ///
    /// Returns true if the request should get a 429. Crossing the failure
    /// threshold (re)starts the ban.
    pub fn check(&mut self, address: &str, now: Instant) -> bool {
        let policy = self.policy;
        let Some(e) = self.entries.get_mut(address) else {
            return false;
        };
        if let Some(until) = e.banned_until {
            if now < until {
                return true;
            }
            e.banned_until = None;
        }
        e.failures
            .retain(|t| now.saturating_duration_since(*t) <= policy.find_time);
        let tripped = !e.failures.is_empty() && e.failures.len() >= policy.max_retry;
        if tripped {
            debug!(
                "Banning {address} for {:?} after {} failures",
                policy.ban_time,
                e.failures.len()
            );
            e.failures.clear();
            e.banned_until = Some(now + policy.ban_time);
        } else if e.is_empty() {
            self.entries.remove(address);
        }
        tripped
    }

    /// Block `address` for `duration`, or lift any block if it's zero.
    pub fn block(&mut self, address: &str, duration: Duration, now: Instant) {
        if duration.is_zero() {
            if let Some(e) = self.entries.get_mut(address) {
                e.banned_until = None;
                e.failures.clear();
            }
            self.entries.remove(address);
            return;
        }
        self.entries.entry(address.to_string()).or_default().banned_until = Some(now + duration);
    }

    #[must_use]
    pub fn is_banned(&self, address: &str, now: Instant) -> bool {
        self.entries
            .get(address)
            .and_then(|e| e.banned_until)
            .is_some_and(|until| now < until)
    }

    /// Drop state that can no longer affect any decision.
    pub fn expire(&mut self, now: Instant) {
        let find_time = self.policy.find_time;
        self.entries.retain(|_, e| {
            if e.banned_until.is_some_and(|until| now >= until) {
                e.banned_until = None;
            }
            e.failures
                .retain(|t| now.saturating_duration_since(*t) <= find_time);
            !e.is_empty()
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "192.0.2.1";
    const B: &str = "192.0.2.2";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn default_bans_on_first_failure() {
        let t0 = Instant::now();
        let mut t = AuthFailureTracker::default();
        assert!(!t.check(A, t0));
        t.record_failure(A, t0);
        assert!(t.check(A, t0 + ms(10)));
        assert!(t.check(A, t0 + ms(500)));
        assert!(!t.check(B, t0 + ms(500)));
        // Ban started at 10ms and lasts a second.
        assert!(t.check(A, t0 + ms(1009)));
        assert!(!t.check(A, t0 + ms(1011)));
    }

    #[test]
    fn threshold_within_find_time() {
        let t0 = Instant::now();
        let mut t = AuthFailureTracker::new(BanPolicy {
            find_time: Duration::from_secs(10),
            ban_time: Duration::from_secs(5),
            max_retry: 3,
        });
        t.record_failure(A, t0);
        t.record_failure(A, t0 + ms(100));
        assert!(!t.check(A, t0 + ms(200)));
        t.record_failure(A, t0 + ms(300));
        assert!(t.check(A, t0 + ms(400)));
        assert!(t.is_banned(A, t0 + ms(5399)));
        assert!(t.check(A, t0 + ms(5000)));
        // After the ban, the slate is clean.
        assert!(!t.check(A, t0 + ms(5401)));
    }

    #[test]
    fn old_failures_age_out() {
        let t0 = Instant::now();
        let mut t = AuthFailureTracker::new(BanPolicy {
            find_time: Duration::from_secs(1),
            ban_time: Duration::from_secs(1),
            max_retry: 2,
        });
        t.record_failure(A, t0);
        t.record_failure(A, t0 + ms(1500));
        assert!(!t.check(A, t0 + ms(1600)));
        t.record_failure(A, t0 + ms(1700));
        assert!(t.check(A, t0 + ms(1800)));
    }

    #[test]
    fn explicit_block_and_clear() {
        let t0 = Instant::now();
        let mut t = AuthFailureTracker::default();
        t.block(A, Duration::from_secs(60), t0);
        assert!(t.check(A, t0 + Duration::from_secs(30)));
        t.block(A, Duration::ZERO, t0 + Duration::from_secs(31));
        assert!(!t.check(A, t0 + Duration::from_secs(31)));
        assert!(t.is_empty());
    }

    #[test]
    fn expire_drops_stale_entries() {
        let t0 = Instant::now();
        let mut t = AuthFailureTracker::default();
        t.record_failure(A, t0);
        t.block(B, Duration::from_secs(2), t0);
        assert_eq!(t.len(), 2);
        t.expire(t0 + ms(1500));
        assert_eq!(t.len(), 1);
        t.expire(t0 + ms(2500));
        assert!(t.is_empty());
    }
}
