//! Embeddable HTTP/1.1 server core.
//!
//! Connections are multiplexed over a few IOThreads, each running its own
//! io_uring completion loop. Request processing is handed to a pool of
//! worker threads that call into a [`Delegate`] supplied by the host
//! program. TLS is done in userspace with rustls.
//!
//! ```no_run
//! use ringserve::{Delegate, Request, Response, Server, ServerHandle, TlsSettings};
//!
//! struct Hello;
//!
//! impl Delegate for Hello {
//!     fn process(
//!         &self,
//!         request: &Request,
//!         response: &mut Response,
//!         _server: &ServerHandle,
//!     ) -> anyhow::Result<bool> {
//!         response.set_header("Content-Type", "text/plain");
//!         response.set_body(format!("Hello {}\n", request.path()));
//!         Ok(true)
//!     }
//! }
//!
//! let server = Server::new(Hello);
//! server.listen("[::]:8080", TlsSettings::none())?;
//! # Ok::<(), ringserve::Error>(())
//! ```
pub mod access;
mod activity;
pub mod admission;
pub mod auth;
pub mod config;
mod connection;
mod delegate;
mod error;
mod io_thread;
mod listener;
mod mailbox;
mod message;
mod parser;
mod server;
pub mod sock;
pub mod tls;
mod worker;

pub use access::{Access, AccessControl, AccessRule};
pub use admission::{Counts, Limits};
pub use auth::{AuthFailureTracker, BanPolicy};
pub use config::Config;
pub use delegate::{Delegate, Streamer};
pub use error::{Error, Result};
pub use message::{Headers, Request, Response, Version, reason_phrase};
pub use server::{Server, ServerHandle};
pub use tls::TlsSettings;
