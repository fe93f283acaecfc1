//! The controller capability and the types that flow through it.
//!
//! A [`Controller`] claims a subset of `(path, method)` pairs and answers
//! requests for them. The dispatcher calls [`Controller::handle`] once per
//! observed chunk of a request, so a single exchange may produce many calls;
//! the controller keeps its progress in the [`ConnectionState`] it is handed
//! and tells the dispatcher what to do next through a [`Step`].
//!
//! Two strategies ship with the crate:
//!
//! - [`Dynamic`]: waits for a request body, calls a user [`Responder`] once,
//!   stores the rendered response and queues it.
//! - [`StaticPage`]: queues a fixed response on the first call.
//!
//! Anything else implements [`Controller`] directly.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::WaitPolicy;
use crate::http::{Headers, Method, RequestHead, Response, StatusCode};

pub mod dynamic;
pub mod fixed;
pub mod state;

pub use dynamic::{Dynamic, FnResponder, Incoming, Responder, route};
pub use fixed::StaticPage;
pub use state::{ConnectionState, Extensions};

/// Opaque identifier of one exchange, assigned by the engine.
///
/// The engine passes the same id for every dispatch of an exchange and to its
/// single completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an exchange ended. Passed to [`Controller::on_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The response was written.
    Completed,
    /// The engine's request deadline elapsed.
    TimedOut,
    /// The peer closed the connection mid-exchange.
    ClientAborted,
    /// Dispatch asked the engine to drop the connection.
    Rejected,
    /// A read or write on the socket failed.
    Error,
    /// The daemon was stopped while the exchange was in flight.
    DaemonShutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::ClientAborted => "client aborted",
            Self::Rejected => "rejected",
            Self::Error => "error",
            Self::DaemonShutdown => "daemon shutdown",
        })
    }
}

/// What a controller wants after one `handle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep the connection open and call again when there is more to do.
    Continue,
    /// Nothing to do yet: suspend this exchange for the given interval, then
    /// continue.
    Wait(Duration),
    /// Drop the connection without a response.
    Abort,
}

/// Failure to hand a response to the engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("a response is already queued for this exchange")]
    AlreadyQueued,

    #[error("connection is closed")]
    Closed,
}

/// The engine's per-exchange handle, used to queue the response.
pub trait ResponseQueue {
    /// The id of the exchange this handle belongs to.
    fn id(&self) -> ConnectionId;

    /// Queues `response` for transmission.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] when the engine cannot take the response now;
    /// the caller may retry on a later call.
    fn queue(&mut self, response: Response) -> Result<(), QueueError>;
}

/// One dispatch invocation: the request head plus the body bytes observed
/// since the previous invocation.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    head: &'a RequestHead,
    peer: &'a str,
    chunk: &'a [u8],
    body_complete: bool,
    wait: WaitPolicy,
}

impl<'a> Exchange<'a> {
    /// `peer` is the textual peer address (empty when unknown), `chunk` the
    /// newly arrived body bytes, and `body_complete` whether the engine has
    /// now delivered the whole declared body.
    pub fn new(
        head: &'a RequestHead,
        peer: &'a str,
        chunk: &'a [u8],
        body_complete: bool,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            head,
            peer,
            chunk,
            body_complete,
            wait,
        }
    }

    pub fn head(&self) -> &'a RequestHead {
        self.head
    }

    pub fn path(&self) -> &'a str {
        self.head.path()
    }

    pub fn method(&self) -> &'a Method {
        self.head.method()
    }

    pub fn peer(&self) -> &'a str {
        self.peer
    }

    pub fn chunk(&self) -> &'a [u8] {
        self.chunk
    }

    pub fn body_complete(&self) -> bool {
        self.body_complete
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }
}

/// The capability every registered handler implements.
///
/// Controllers are registered once and shared across connection tasks, so
/// they must be `Send + Sync`. Per-exchange data belongs in the
/// [`ConnectionState`], never in the controller itself.
pub trait Controller: Send + Sync {
    /// Whether this controller answers `method` requests for `path`.
    fn accepts(&self, path: &str, method: &Method) -> bool;

    /// Advances the exchange by one step.
    fn handle(
        &self,
        exchange: &Exchange<'_>,
        state: &mut ConnectionState,
        queue: &mut dyn ResponseQueue,
    ) -> Step;

    /// Called exactly once when the exchange ends; consumes the state.
    fn on_complete(&self, state: ConnectionState, reason: TerminationReason) {
        tracing::trace!(
            reason = %reason,
            sent = state.is_sent(),
            "exchange state released"
        );
    }

    /// Creates the state for a new exchange.
    fn new_state(&self) -> ConnectionState {
        ConnectionState::new()
    }
}

/// Status, headers and a diagnostic message produced by a [`Responder`].
///
/// [`ResponseParams::abort`] is the sentinel that tells the server to drop the
/// connection instead of answering.
///
/// # Examples
///
/// ```
/// use ctlhttpd::controller::ResponseParams;
/// use ctlhttpd::http::StatusCode;
///
/// let params = ResponseParams::new(StatusCode::Created)
///     .header("Location", "/items/7")
///     .message("item stored");
/// assert_eq!(params.status(), Some(StatusCode::Created));
/// assert!(!params.is_abort());
/// assert!(ResponseParams::abort().is_abort());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParams {
    status: Option<StatusCode>,
    headers: Headers,
    message: String,
}

impl ResponseParams {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            headers: Headers::new(),
            message: String::new(),
        }
    }

    /// `200 OK` with no extra headers.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    /// Abort the connection instead of responding.
    pub fn abort() -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            message: String::new(),
        }
    }

    /// Appends a response header; order is kept on the wire.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attaches a diagnostic message. It is logged, never sent.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// `None` for the abort sentinel.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn is_abort(&self) -> bool {
        self.status.is_none()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn diagnostic(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_parts(self) -> (Option<StatusCode>, Headers, String) {
        (self.status, self.headers, self.message)
    }
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self::ok()
    }
}

/// A [`ResponseQueue`] that keeps queued responses in memory. Handy for
/// driving controllers without an engine.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    id: u64,
    queued: Option<Response>,
    refuse: bool,
}

impl MemoryQueue {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Makes every `queue` call fail with [`QueueError::Closed`] while set.
    pub fn set_refuse(&mut self, refuse: bool) {
        self.refuse = refuse;
    }

    pub fn queued(&self) -> Option<&Response> {
        self.queued.as_ref()
    }

    pub fn take(&mut self) -> Option<Response> {
        self.queued.take()
    }
}

impl ResponseQueue for MemoryQueue {
    fn id(&self) -> ConnectionId {
        ConnectionId::new(self.id)
    }

    fn queue(&mut self, response: Response) -> Result<(), QueueError> {
        if self.refuse {
            return Err(QueueError::Closed);
        }
        if self.queued.is_some() {
            return Err(QueueError::AlreadyQueued);
        }
        self.queued = Some(response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_queue_accepts_one_response() {
        let mut q = MemoryQueue::new(3);
        assert_eq!(q.id(), ConnectionId::new(3));
        assert!(q.queue(Response::new(StatusCode::Ok)).is_ok());
        assert_eq!(
            q.queue(Response::new(StatusCode::Ok)),
            Err(QueueError::AlreadyQueued)
        );
        assert_eq!(q.take().map(|r| r.status()), Some(StatusCode::Ok));
    }

    #[test]
    fn params_keep_header_order() {
        let p = ResponseParams::ok().header("B", "1").header("A", "2");
        let names: Vec<_> = p.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["B", "A"]);
        assert_eq!(ResponseParams::default(), ResponseParams::ok());
    }
}
