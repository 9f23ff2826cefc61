//! The application side of the server.
use crate::mailbox::{IoMessage, Origin};
use crate::message::{Request, Response};
use crate::server::ServerHandle;

/// Request processing supplied by the host program.
///
/// Hooks run on worker threads, never on an IOThread, with the exception of
/// [`Delegate::incremental`] which must be cheap.
///
/// Returning an error from any of the processing hooks, or panicking, turns
/// the response into a 500 and closes the connection.
pub trait Delegate: Send + Sync + 'static {
    /// Called before [`Delegate::process`]. Returning true means the
    /// response is complete and `process` is skipped.
    fn pre_process(
        &self,
        _request: &Request,
        _response: &mut Response,
        _server: &ServerHandle,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Fill in the response.
    ///
    /// Return true if the response is ready to send. Returning false defers
    /// it: the delegate must move the response out (e.g. with
    /// `std::mem::take`) and later hand it to [`ServerHandle::completed`],
    /// from any thread.
    ///
    /// With incremental processing this is also called for partial
    /// requests (see [`Request::is_complete`]). What it does to the response
    /// in that case is ignored.
    fn process(
        &self,
        request: &Request,
        response: &mut Response,
        server: &ServerHandle,
    ) -> anyhow::Result<bool>;

    /// Called after `process` for responses that are sent right away.
    fn post_process(
        &self,
        _request: &Request,
        _response: &mut Response,
        _server: &ServerHandle,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Opt in to seeing the body while it arrives.
    ///
    /// Called once the request header is complete. A nonzero return is the
    /// number of new body bytes to collect before each call to `process`
    /// with the partial request.
    fn incremental(&self, _request: &Request, _server: &ServerHandle) -> usize {
        0
    }

    /// Something is wrong and a human should know.
    fn alert(&self, message: &str, _server: &ServerHandle) {
        eprintln!("ALERT: {message}");
    }

    /// One line per completed request.
    fn audit(&self, message: &str, _server: &ServerHandle) {
        eprintln!("{message}");
    }

    /// Verbose, duration and raw I/O logging.
    fn debug(&self, _message: &str, _server: &ServerHandle) {}
}

/// Handle for sending the body of a streaming response.
///
/// Dropping it ends the stream.
#[derive(Debug)]
pub struct Streamer {
    origin: Origin,
    done: bool,
}

impl Streamer {
    pub(crate) fn new(origin: Origin) -> Self {
        Self {
            origin,
            done: false,
        }
    }

    /// False once the client is gone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.done && self.origin.alive()
    }

    /// Queue another piece of body. Returns false if the client has
    /// disconnected, in which case there's no point sending more.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.origin.mailbox.send(IoMessage::StreamData {
            slot: self.origin.slot,
            identity: self.origin.identity,
            data: data.into(),
        })
    }

    /// End the response.
    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.origin.mailbox.send(IoMessage::StreamEnd {
            slot: self.origin.slot,
            identity: self.origin.identity,
        });
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.end();
    }
}
