//! Immutable per-connection policy.
//!
//! A `Config` is never modified after construction. The server keeps the
//! current one behind an `Arc`, and every connection grabs a clone of that
//! `Arc` when it is created. Reconfiguring builds a new `Config` and swaps
//! the pointer, so in-flight connections keep seeing the policy they started
//! with.

use std::collections::BTreeSet;
use std::time::Duration;

/// Default maximum size of a request body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Default maximum size of the request line plus headers.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Default number of requests served on one connection before closing it.
pub const DEFAULT_MAX_CONNECTION_REQUESTS: usize = 100;

/// Default wall time a single connection may stay open.
pub const DEFAULT_MAX_CONNECTION_DURATION: Duration = Duration::from_secs(10);

const DEFAULT_METHODS: &[&str] = &["DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT"];

#[derive(Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    /// Log every request and response through the delegate debug hook.
    pub verbose: bool,

    /// Log request and connection durations.
    pub durations: bool,

    /// Look up the host name of each remote address.
    pub reverse: bool,

    /// We sit behind a TLS terminating proxy, whose headers are trusted.
    pub secure_proxy: bool,

    /// Log raw bytes read and written.
    pub log_raw_io: bool,

    /// Fold long response header lines.
    pub fold_headers: bool,

    pub max_body_size: usize,
    pub max_request_size: usize,

    /// Zero means unlimited.
    pub max_connection_requests: usize,

    /// Zero means unlimited.
    pub max_connection_duration: Duration,

    /// Upper case method names.
    pub permitted_methods: BTreeSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            durations: false,
            reverse: false,
            secure_proxy: false,
            log_raw_io: false,
            fold_headers: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_connection_requests: DEFAULT_MAX_CONNECTION_REQUESTS,
            max_connection_duration: DEFAULT_MAX_CONNECTION_DURATION,
            permitted_methods: DEFAULT_METHODS.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn permits(&self, method: &str) -> bool {
        self.permitted_methods.contains(method)
    }

    /// Value for the `Allow` header of a 405 response.
    #[must_use]
    pub fn allow_header(&self) -> String {
        self.permitted_methods
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True if a connection of this age has used up its allowed lifetime.
    #[must_use]
    pub fn duration_exceeded(&self, age: Duration) -> bool {
        !self.max_connection_duration.is_zero() && age >= self.max_connection_duration
    }

    /// True if a connection that has served `count` requests may not serve
    /// another one.
    #[must_use]
    pub fn requests_exceeded(&self, count: usize) -> bool {
        self.max_connection_requests != 0 && count >= self.max_connection_requests
    }
}
