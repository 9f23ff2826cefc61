use std::net::SocketAddr;

/// Errors reported to the host program by administrative calls.
///
/// Per-connection failures never surface here. They are contained to the
/// connection that caused them, and only show up in the logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no usable certificate in {}", .0.display())]
    NoCertificate(std::path::PathBuf),

    #[error("no usable private key in {}", .0.display())]
    NoPrivateKey(std::path::PathBuf),

    #[error("private key in {} is encrypted, and no password was given", .0.display())]
    KeyPassword(std::path::PathBuf),

    #[error("failed to decrypt private key in {}: {source}", .path.display())]
    KeyDecrypt {
        path: std::path::PathBuf,
        source: pkcs8::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("invalid listen address {0:?}")]
    BadAddress(String),

    #[error("setting can only be changed while the server is not running")]
    Running,

    #[error("server has been shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
