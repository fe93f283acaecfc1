//! Single-shot controller serving a fixed response.

use bytes::Bytes;

use super::{ConnectionState, Controller, Exchange, ResponseQueue, Step};
use crate::http::{Headers, Method, Response, StatusCode};

/// Answers one method + path with the same response every time.
///
/// There is no body gate: the response is queued on the first call, which
/// makes this the natural choice for health checks and canned pages.
///
/// ```rust
/// use ctlhttpd::controller::StaticPage;
/// use ctlhttpd::http::Method;
///
/// let healthz = StaticPage::new(Method::Get, "/healthz", "ok");
/// ```
#[derive(Debug, Clone)]
pub struct StaticPage {
    method: Method,
    path: String,
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl StaticPage {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl Controller for StaticPage {
    fn accepts(&self, path: &str, method: &Method) -> bool {
        self.path == path && self.method == *method
    }

    fn handle(
        &self,
        _exchange: &Exchange<'_>,
        state: &mut ConnectionState,
        queue: &mut dyn ResponseQueue,
    ) -> Step {
        if state.is_sent() {
            return Step::Continue;
        }
        let response = Response::from_parts(self.status, self.headers.clone(), self.body.clone());
        if queue.queue(response).is_ok() {
            state.mark_sent();
        }
        Step::Continue
    }
}
