//! Demo server.
//!
//! Serves a few synthetic pages that exercise the server core:
//!
//! * `/` and anything not listed below: echo of the request.
//! * `/stream`: a chunked response, sent from another thread.
//! * `/later`: a response deferred and completed from another thread.
//! * `/panic`: a delegate that panics, to show the 500 path.
#![allow(clippy::similar_names)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, trace};

use ringserve::{
    AccessControl, AccessRule, BanPolicy, Delegate, Request, Response, Server, ServerHandle,
    TlsSettings,
};

struct Demo;

impl Delegate for Demo {
    fn process(
        &self,
        request: &Request,
        response: &mut Response,
        server: &ServerHandle,
    ) -> anyhow::Result<bool> {
        if !request.is_complete() {
            trace!("Got {} bytes of body so far", request.body().len());
            return Ok(true);
        }
        match request.path() {
            "/stream" => {
                let Some(streamer) = response.streamer() else {
                    anyhow::bail!("response has no origin");
                };
                response.set_header("Content-Type", "text/plain");
                response.set_streaming(true);
                response.set_body("counting\n");
                std::thread::spawn(move || {
                    for n in 1..=5 {
                        std::thread::sleep(Duration::from_millis(200));
                        if !streamer.send(format!("{n}\n")) {
                            debug!("Stream reader went away at {n}");
                            return;
                        }
                    }
                    streamer.finish();
                });
                Ok(true)
            }
            "/later" => {
                let mut deferred = std::mem::take(response);
                let server = server.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(500));
                    deferred.set_header("Content-Type", "text/plain");
                    deferred.set_body("Sorry for the wait.\n");
                    if !server.completed(deferred) {
                        debug!("Deferred response had nowhere to go");
                    }
                });
                Ok(false)
            }
            "/panic" => panic!("asked to panic"),
            _ => {
                let mut out = format!(
                    "{} {} {}\n",
                    request.method(),
                    request.path(),
                    request.version().as_str()
                );
                for (name, value) in request.headers().iter() {
                    out.push_str(&format!("{name}: {value}\n"));
                }
                out.push_str(&format!("\n{} byte body\n", request.body().len()));
                response.set_header("Content-Type", "text/plain");
                response.set_body(out);
                Ok(true)
            }
        }
    }

    fn incremental(&self, request: &Request, _server: &ServerHandle) -> usize {
        // Look at uploads 64KiB at a time.
        if request.method() == "PUT" { 65536 } else { 0 }
    }

    fn debug(&self, message: &str, _server: &ServerHandle) {
        debug!("{message}");
    }

    fn audit(&self, message: &str, _server: &ServerHandle) {
        info!("{message}");
    }
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Parser)]
struct Opt {
    #[arg(
        long,
        short,
        help = "Verbosity level. Can be error, warn info, debug, or trace.",
        default_value = "info"
    )]
    verbose: String,

    #[arg(long, short, help = "Listen address.", default_value = "[::]:8080")]
    listen: String,

    #[arg(long, short = 'P', help = "TLS private key")]
    tls_key: Option<std::path::PathBuf>,

    #[arg(long, short = 'C', help = "TLS certificate chain")]
    tls_cert: Option<std::path::PathBuf>,

    /// Password for an encrypted TLS private key.
    #[arg(long)]
    tls_password: Option<String>,

    #[arg(long, default_value_t = 1, help = "Number of IOThreads to run")]
    threads: usize,

    #[arg(long, default_value_t = 4, help = "Number of worker threads")]
    pool_size: usize,

    #[arg(long, help = "Enable CPU affinity 1:1 for IOThreads")]
    cpu_affinity: bool,

    #[arg(long, default_value = "100ms", value_parser = parse_duration, help = "Timeout sweep period.")]
    tick: Duration,

    /// Max concurrent connections. 0 for unlimited.
    #[arg(long, default_value_t = 128)]
    max_connections: usize,

    /// Max concurrent connections per client address. 0 for unlimited.
    #[arg(long, default_value_t = 32)]
    max_per_host: usize,

    #[arg(long, default_value_t = false, value_parser = parse_bool, help = "Answer 503 when full, instead of leaving clients in the backlog.")]
    reject: std::primitive::bool,

    #[arg(long, default_value = "30s", value_parser = parse_duration, help = "Connection idle timeout.")]
    idle_timeout: Duration,

    #[arg(long, default_value_t = 100, help = "Keepalive connections per IOThread. 0 disables keepalive.")]
    max_keepalive: usize,

    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_body_size: usize,

    #[arg(long, default_value_t = 8 * 1024)]
    max_request_size: usize,

    #[arg(long, default_value_t = 100, help = "Requests per connection. 0 for unlimited.")]
    max_requests: usize,

    #[arg(long, default_value = "10s", value_parser = parse_duration, help = "Connection lifetime. 0s for unlimited.")]
    max_duration: Duration,

    /// Comma separated list of permitted methods.
    #[arg(long, value_delimiter = ',')]
    methods: Option<Vec<String>>,

    /// Only accept connections from these addresses.
    #[arg(long, value_delimiter = ',')]
    allow: Option<Vec<String>>,

    /// Leave these addresses out of logs and statistics.
    #[arg(long, value_delimiter = ',')]
    quiet: Vec<String>,

    #[arg(long, default_value = "1s", value_parser = parse_duration, help = "Window for counting auth failures.")]
    find_time: Duration,

    #[arg(long, default_value = "1s", value_parser = parse_duration, help = "How long an auth ban lasts.")]
    ban_time: Duration,

    #[arg(long, default_value_t = 0, help = "Auth failures in the window before a ban.")]
    max_retry: usize,

    /// Protect a path prefix with HTTP Basic auth, as
    /// `prefix:realm:user:password`. May be repeated.
    #[arg(long)]
    access: Vec<String>,

    /// Log requests and responses.
    #[arg(long)]
    http_verbose: bool,

    /// Log request and connection durations.
    #[arg(long)]
    durations: bool,

    /// Log raw bytes read and written.
    #[arg(long)]
    log_raw_io: bool,

    /// Look up client host names.
    #[arg(long)]
    reverse: bool,

    /// Trust x-forwarded-for and x-cert-* from a TLS terminating proxy.
    #[arg(long)]
    secure_proxy: bool,

    /// Fold long response header lines.
    #[arg(long)]
    fold_headers: bool,
}

fn parse_bool(input: &str) -> Result<bool, String> {
    match input.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("Invalid value for flag: {input}")),
    }
}

#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_possible_truncation)]
fn parse_duration(time_str: &str) -> Result<Duration, String> {
    if time_str.ends_with("ms") {
        let ms = time_str
            .trim_end_matches("ms")
            .parse::<u64>()
            .map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if time_str.ends_with('s') {
        let secs = time_str
            .trim_end_matches('s')
            .parse::<f64>()
            .map_err(|_| "Invalid seconds")?;
        if secs < 0.0 {
            return Err("Negative duration".to_string());
        }
        let secs_whole = secs.trunc() as u64;
        let nanos = (secs.fract() * 1_000_000_000.0) as u32;
        Ok(Duration::new(secs_whole, nanos))
    } else {
        Err("Invalid format. Use 'Xs' or 'Yms' (e.g., '1.5s', '500ms')".to_string())
    }
}

fn parse_access(specs: &[String]) -> Result<AccessControl> {
    let mut ac = AccessControl::new();
    for spec in specs {
        let mut parts = spec.splitn(4, ':');
        let (Some(prefix), Some(realm), Some(user), Some(pass)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("bad --access {spec:?}, want prefix:realm:user:password");
        };
        let mut rule = AccessRule {
            realm: realm.to_string(),
            ..Default::default()
        };
        rule.users.insert(user.to_string(), pass.to_string());
        ac.insert(prefix, rule);
    }
    Ok(ac)
}

fn configure(server: &Server, opt: &Opt) -> Result<()> {
    server.set_io_threads(opt.threads)?;
    server.set_pool_size(opt.pool_size)?;
    server.set_cpu_affinity(opt.cpu_affinity)?;
    server.set_tick(opt.tick)?;

    server.set_max_connections(opt.max_connections);
    server.set_max_per_host(opt.max_per_host);
    server.set_reject(opt.reject);
    server.set_idle_timeout(opt.idle_timeout);
    server.set_max_keepalive(opt.max_keepalive);

    server.set_max_body_size(opt.max_body_size);
    server.set_max_request_size(opt.max_request_size);
    server.set_max_connection_requests(opt.max_requests);
    server.set_max_connection_duration(opt.max_duration);
    if let Some(methods) = &opt.methods {
        server.set_permitted_methods(methods.iter().map(|m| m.to_uppercase()));
    }
    server.set_allowed_hosts(opt.allow.clone());
    server.set_quiet_hosts(opt.quiet.iter().cloned());

    server.set_ban_policy(BanPolicy {
        find_time: opt.find_time,
        ban_time: opt.ban_time,
        max_retry: opt.max_retry,
    });
    server.set_access(parse_access(&opt.access)?);

    server.set_verbose(opt.http_verbose);
    if opt.durations {
        server.set_durations(true);
    }
    server.set_log_raw_io(opt.log_raw_io);
    server.set_reverse(opt.reverse);
    server.set_secure_proxy(opt.secure_proxy);
    server.set_fold_headers(opt.fold_headers);
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    tracing_subscriber::fmt()
        .with_env_filter(format!("ringserve={}", opt.verbose))
        .with_writer(std::io::stderr)
        .init();

    let tls = match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert), Some(key)) => match &opt.tls_password {
            Some(password) => TlsSettings::load_with_password(cert, key, password),
            None => TlsSettings::load(cert, key),
        }
        .with_context(|| format!("Loading TLS cert {} and key {}", cert.display(), key.display()))?,
        (None, None) => TlsSettings::none(),
        _ => anyhow::bail!("--tls-cert and --tls-key go together"),
    };

    let server = Server::new(Demo);
    configure(&server, &opt)?;
    let addr = server
        .listen(&opt.listen, tls)
        .with_context(|| format!("Listening on {}", opt.listen))?;
    info!("Serving on {addr}");
    loop {
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn bools() {
        assert_eq!(parse_bool("Yes"), Ok(true));
        assert_eq!(parse_bool("0"), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn access_specs() -> Result<()> {
        let ac = parse_access(&["/admin:Admin:root:a:b".to_string()])?;
        assert_eq!(
            ac.check("/admin/x", Some("root"), Some("a:b")),
            ringserve::Access::Granted
        );
        assert!(parse_access(&["/admin:Admin".to_string()]).is_err());
        Ok(())
    }
}
