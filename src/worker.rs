//! WorkerPool: runs delegate processing off the IOThreads.
//!
//! Jobs queue on one unbounded channel shared by all workers. The number of
//! jobs in flight is bounded by the connection cap, since a connection has
//! at most one job outstanding.
use std::panic::{AssertUnwindSafe, catch_unwind};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, trace};

use crate::error::Result;
use crate::mailbox::{IoMessage, Origin};
use crate::message::{Request, Response};
use crate::server::ServerHandle;

/// One request, partial or complete, to hand to the delegate.
pub(crate) struct Job {
    pub request: Request,
    pub origin: Origin,
}

pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` worker threads.
    ///
    /// # Errors
    ///
    /// Failure to spawn a thread.
    pub fn start(size: usize, server: &ServerHandle) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut pool = Self {
            tx: Some(tx),
            handles: Vec::with_capacity(size),
        };
        for n in 0..size.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let server = server.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker/{n}"))
                .spawn(move || {
                    for job in rx {
                        run(job, &server);
                    }
                    trace!("Worker {n} exiting");
                })?;
            pool.handles.push(handle);
        }
        Ok(pool)
    }

    /// Where IOThreads submit jobs. None once shut down.
    #[must_use]
    pub fn sender(&self) -> Option<Sender<Job>> {
        self.tx.clone()
    }

    /// Let queued jobs finish, and wait for the workers to exit.
    ///
    /// IOThreads hold senders too, so they have to be gone first.
    pub fn shutdown(&mut self) {
        self.tx = None;
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                error!("Worker panicked outside of processing");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(e: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = e.downcast_ref::<&str>() {
        s
    } else if let Some(s) = e.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// Replace whatever the delegate did with a 500, and drop the connection.
fn fail(origin: &Origin, server: &ServerHandle, what: &str) {
    server.alert(what);
    let mut response = Response::error(500);
    response.set_close(true);
    origin.mailbox.send(IoMessage::Completed {
        slot: origin.slot,
        identity: origin.identity,
        response,
    });
}

/// Process one job, and send the outcome back to the owning IOThread.
pub(crate) fn run(job: Job, server: &ServerHandle) {
    let Job { request, origin } = job;
    if !origin.alive() {
        debug!("Dropping job for closed connection {}", origin.identity);
        return;
    }
    let delegate = server.shared.delegate.clone();
    let mut response = Response::with_origin(origin.clone());

    if !request.is_complete() {
        // Partial body. Only the side effects matter.
        match catch_unwind(AssertUnwindSafe(|| {
            delegate.process(&request, &mut response, server)
        })) {
            Ok(Ok(_)) => {
                origin.mailbox.send(IoMessage::Partial {
                    slot: origin.slot,
                    identity: origin.identity,
                    request,
                });
            }
            Ok(Err(e)) => fail(
                &origin,
                server,
                &format!("Processing partial {} {}: {e:#}", request.method(), request.path()),
            ),
            Err(e) => fail(
                &origin,
                server,
                &format!(
                    "Panic processing partial {} {}: {}",
                    request.method(),
                    request.path(),
                    panic_message(e.as_ref())
                ),
            ),
        }
        return;
    }

    let result = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<bool> {
        let handled = delegate.pre_process(&request, &mut response, server)?
            || delegate.process(&request, &mut response, server)?;
        if handled {
            delegate.post_process(&request, &mut response, server)?;
        }
        Ok(handled)
    }));
    match result {
        Ok(Ok(true)) => {
            origin.mailbox.send(IoMessage::Completed {
                slot: origin.slot,
                identity: origin.identity,
                response,
            });
        }
        Ok(Ok(false)) => trace!("Response to {} deferred", origin.identity),
        Ok(Err(e)) => fail(
            &origin,
            server,
            &format!("Processing {} {}: {e:#}", request.method(), request.path()),
        ),
        Err(e) => fail(
            &origin,
            server,
            &format!(
                "Panic processing {} {}: {}",
                request.method(),
                request.path(),
                panic_message(e.as_ref())
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::Delegate;
    use crate::mailbox::{Mailbox, Wakeup};
    use crate::message::{Headers, Version};
    use crate::server::Server;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        post: AtomicUsize,
    }

    impl Delegate for Counting {
        fn process(
            &self,
            request: &Request,
            response: &mut Response,
            _server: &ServerHandle,
        ) -> anyhow::Result<bool> {
            match request.path() {
                "/fail" => anyhow::bail!("nope"),
                "/panic" => panic!("boom"),
                "/defer" => {
                    let _ = std::mem::take(response);
                    Ok(false)
                }
                _ => {
                    response.set_body("ok");
                    Ok(true)
                }
            }
        }

        fn post_process(
            &self,
            _request: &Request,
            _response: &mut Response,
            _server: &ServerHandle,
        ) -> anyhow::Result<()> {
            self.post.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn alert(&self, _message: &str, _server: &ServerHandle) {}
    }

    fn request(path: &str, complete: bool) -> Request {
        Request {
            method: "GET".to_string(),
            path: path.to_string(),
            query: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
            complete,
        }
    }

    fn origin() -> (Origin, crossbeam_channel::Receiver<IoMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mailbox = Mailbox::new(tx, Wakeup::new().unwrap());
        (
            Origin {
                mailbox,
                slot: 3,
                identity: 42,
                alive: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    fn completed(rx: &crossbeam_channel::Receiver<IoMessage>) -> Response {
        match rx.try_recv().unwrap() {
            IoMessage::Completed {
                slot,
                identity,
                response,
            } => {
                assert_eq!((slot, identity), (3, 42));
                response
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn complete_request() {
        let delegate = Arc::new(Counting::default());
        let server = Server::with_delegate(delegate.clone());
        let (origin, rx) = origin();
        run(
            Job {
                request: request("/", true),
                origin,
            },
            &server,
        );
        let r = completed(&rx);
        assert_eq!(r.body(), b"ok");
        assert_eq!(delegate.post.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn deferred_skips_post_process() {
        let delegate = Arc::new(Counting::default());
        let server = Server::with_delegate(delegate.clone());
        let (origin, rx) = origin();
        run(
            Job {
                request: request("/defer", true),
                origin,
            },
            &server,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(delegate.post.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn errors_and_panics_become_500() {
        let server = Server::new(Counting::default());
        for path in ["/fail", "/panic"] {
            let (origin, rx) = origin();
            run(
                Job {
                    request: request(path, true),
                    origin,
                },
                &server,
            );
            let r = completed(&rx);
            assert_eq!(r.status(), 500, "{path}");
            assert!(r.close(), "{path}");
        }
    }

    #[test]
    fn partial_request_comes_back() {
        let server = Server::new(Counting::default());
        let (origin, rx) = origin();
        run(
            Job {
                request: request("/", false),
                origin,
            },
            &server,
        );
        match rx.try_recv().unwrap() {
            IoMessage::Partial { request, .. } => assert!(!request.is_complete()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn closed_connection_is_skipped() {
        let server = Server::new(Counting::default());
        let (origin, rx) = origin();
        origin.alive.store(false, Ordering::Release);
        run(
            Job {
                request: request("/", true),
                origin,
            },
            &server,
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pool_runs_jobs() {
        let server = Server::new(Counting::default());
        let mut pool = WorkerPool::start(2, &server).unwrap();
        let (origin, rx) = origin();
        pool.sender()
            .unwrap()
            .send(Job {
                request: request("/", true),
                origin,
            })
            .unwrap();
        let msg = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert!(matches!(msg, IoMessage::Completed { .. }));
        pool.shutdown();
        assert!(pool.sender().is_none());
    }
}
