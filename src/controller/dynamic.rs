//! The wait / assemble / send state machine for user-rendered pages.
//!
//! [`Dynamic`] wraps a [`Responder`] and drives one exchange through:
//!
//! ```text
//!  AWAITING_BODY ──body complete──▶ ASSEMBLING ──queued──▶ SENT
//!       │                              │
//!       └── wait budget exhausted ─────┴── abort sentinel ──▶ ABORTED
//! ```
//!
//! Requests without a body skip straight to `ASSEMBLING`. The responder runs
//! at most once per exchange; its output is kept in the [`ConnectionState`]
//! so a failed queue attempt is retried on the next call without rendering
//! again.

use bytes::Bytes;
use tracing::{debug, trace};

use super::{ConnectionState, Controller, Exchange, ResponseParams, ResponseQueue, Step};
use crate::http::{Headers, Method, RequestHead};

/// User logic behind a [`Dynamic`] controller.
pub trait Responder: Send + Sync {
    /// Whether this responder answers `method` requests for `path`.
    fn accepts(&self, path: &str, method: &Method) -> bool;

    /// Renders the response body into `out` and returns its status and
    /// headers, or [`ResponseParams::abort`] to drop the connection.
    fn respond(&self, request: &Incoming<'_>, out: &mut String) -> ResponseParams;
}

/// The request as seen by a [`Responder`]: head, peer and the complete body.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    head: &'a RequestHead,
    peer: &'a str,
    body: &'a [u8],
}

impl<'a> Incoming<'a> {
    pub fn new(head: &'a RequestHead, peer: &'a str, body: &'a [u8]) -> Self {
        Self { head, peer, body }
    }

    pub fn method(&self) -> &'a Method {
        self.head.method()
    }

    pub fn path(&self) -> &'a str {
        self.head.path()
    }

    pub fn version(&self) -> &'static str {
        self.head.version_str()
    }

    pub fn headers(&self) -> &'a Headers {
        self.head.headers()
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.head.headers().get(name)
    }

    pub fn query_param(&self, key: &str) -> Option<&'a str> {
        self.head.query_param(key)
    }

    /// Textual peer address, empty when the engine could not determine it.
    pub fn peer(&self) -> &'a str {
        self.peer
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// The body as UTF-8, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&'a str> {
        std::str::from_utf8(self.body).ok()
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.body)
    }
}

/// A controller that waits for the request body, renders once through a
/// [`Responder`] and queues the result.
///
/// # Examples
///
/// ```rust
/// use std::fmt::Write;
/// use ctlhttpd::controller::{Dynamic, Incoming, Responder, ResponseParams};
/// use ctlhttpd::http::Method;
///
/// struct Hello;
///
/// impl Responder for Hello {
///     fn accepts(&self, path: &str, method: &Method) -> bool {
///         path == "/" && *method == Method::Get
///     }
///
///     fn respond(&self, req: &Incoming<'_>, out: &mut String) -> ResponseParams {
///         let _ = write!(out, "hello {}", req.peer());
///         ResponseParams::ok().header("Content-Type", "text/plain")
///     }
/// }
///
/// let controller = Dynamic::new(Hello);
/// ```
#[derive(Debug)]
pub struct Dynamic<R> {
    responder: R,
}

impl<R: Responder> Dynamic<R> {
    pub fn new(responder: R) -> Self {
        Self { responder }
    }

    pub fn responder(&self) -> &R {
        &self.responder
    }
}

impl<R: Responder> Controller for Dynamic<R> {
    fn accepts(&self, path: &str, method: &Method) -> bool {
        self.responder.accepts(path, method)
    }

    fn handle(
        &self,
        exchange: &Exchange<'_>,
        state: &mut ConnectionState,
        queue: &mut dyn ResponseQueue,
    ) -> Step {
        // A response is already on its way; later calls are pass-through.
        if state.is_sent() {
            return Step::Continue;
        }

        state.append_request_body(exchange.chunk());

        if !state.is_assembled() {
            if exchange.method().carries_body() && !exchange.body_complete() {
                if !exchange.chunk().is_empty() {
                    return Step::Continue;
                }

                let policy = exchange.wait_policy();
                // The budget bounds a silent peer only; once the upload has
                // started the request deadline caps it.
                if !state.request_body().is_empty() {
                    return Step::Wait(policy.poll_interval);
                }
                let waited = state.record_wait();
                if waited > policy.max_wait_loops {
                    debug!(
                        id = %queue.id(),
                        path = exchange.path(),
                        waited,
                        "request body never arrived, dropping connection"
                    );
                    return Step::Abort;
                }
                return Step::Wait(policy.poll_interval);
            }

            let mut rendered = String::new();
            let params = {
                let incoming = Incoming::new(exchange.head(), exchange.peer(), state.request_body());
                self.responder.respond(&incoming, &mut rendered)
            };

            let (status, headers, message) = params.into_parts();
            let Some(status) = status else {
                debug!(
                    id = %queue.id(),
                    path = exchange.path(),
                    message = %message,
                    "responder aborted the exchange"
                );
                return Step::Abort;
            };
            if !message.is_empty() {
                trace!(id = %queue.id(), message = %message, "responder diagnostic");
            }
            state.assemble(status, headers, Bytes::from(rendered));
        }

        let Some(response) = state.to_response() else {
            return Step::Continue;
        };

        match queue.queue(response) {
            Ok(()) => state.mark_sent(),
            Err(e) => debug!(id = %queue.id(), error = %e, "queueing response failed, will retry"),
        }
        Step::Continue
    }
}

/// A [`Responder`] built from a closure bound to one method and path.
pub struct FnResponder<F> {
    method: Method,
    path: String,
    render: F,
}

impl<F> Responder for FnResponder<F>
where
    F: Fn(&Incoming<'_>, &mut String) -> ResponseParams + Send + Sync,
{
    fn accepts(&self, path: &str, method: &Method) -> bool {
        self.path == path && self.method == *method
    }

    fn respond(&self, request: &Incoming<'_>, out: &mut String) -> ResponseParams {
        (self.render)(request, out)
    }
}

/// Builds a [`Dynamic`] controller for exactly `method` + `path` from a
/// closure.
///
/// ```rust
/// use ctlhttpd::controller::{ResponseParams, route};
/// use ctlhttpd::http::Method;
///
/// let echo = route(Method::Post, "/echo", |req, out| {
///     out.push_str(req.body_text().unwrap_or(""));
///     ResponseParams::ok()
/// });
/// ```
pub fn route<F>(method: Method, path: impl Into<String>, render: F) -> Dynamic<FnResponder<F>>
where
    F: Fn(&Incoming<'_>, &mut String) -> ResponseParams + Send + Sync,
{
    Dynamic::new(FnResponder {
        method,
        path: path.into(),
        render,
    })
}
