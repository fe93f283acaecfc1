//! Request dispatch: access check, controller selection and state lifecycle.
//!
//! The engine calls [`Dispatcher::dispatch`] for every observed chunk of an
//! exchange and [`Dispatcher::complete`] exactly once when the exchange ends.
//! Between those two calls the dispatcher owns the exchange's
//! [`ConnectionState`](crate::controller::ConnectionState).

mod table;

use std::sync::Arc;

use tracing::{debug, trace};

use self::table::{ConnectionTable, Slot};
use crate::access::AccessFilter;
use crate::controller::{ConnectionId, Exchange, ResponseQueue, Step, TerminationReason};
use crate::http::{Response, StatusCode};
use crate::router::Router;

/// What the engine should do after a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep the exchange going: flush a queued response or read more body.
    Continue,
    /// The peer was refused; a `403` has been queued.
    Forbidden,
    /// No controller matched; a `404` has been queued.
    NotFound,
    /// Drop the connection without a response.
    Abort,
}

/// Routes exchanges to controllers and keeps their state between calls.
pub struct Dispatcher {
    router: Router,
    access: AccessFilter,
    table: ConnectionTable,
}

impl Dispatcher {
    pub fn new(router: Router, access: AccessFilter) -> Self {
        Self {
            router,
            access,
            table: ConnectionTable::new(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn access(&self) -> &AccessFilter {
        &self.access
    }

    /// Number of exchanges currently holding state.
    pub fn live(&self) -> usize {
        self.table.len()
    }

    /// Handles one chunk of an exchange.
    ///
    /// When the controller asks to wait, the wait happens here before
    /// returning [`Directive::Continue`].
    pub async fn dispatch(
        &self,
        queue: &mut (dyn ResponseQueue + Send),
        exchange: &Exchange<'_>,
    ) -> Directive {
        let id = queue.id();

        if !self.access.is_allowed(exchange.peer()) {
            debug!(id = %id, peer = %exchange.peer(), "peer not allowed");
            queue_status(queue, StatusCode::Forbidden);
            return Directive::Forbidden;
        }

        let Some(step) = self.step(id, queue, exchange) else {
            debug!(
                id = %id,
                method = %exchange.method(),
                path = %exchange.path(),
                "no controller matched"
            );
            queue_status(queue, StatusCode::NotFound);
            return Directive::NotFound;
        };

        match step {
            Step::Continue => Directive::Continue,
            Step::Abort => Directive::Abort,
            Step::Wait(delay) => {
                trace!(id = %id, delay_ms = delay.as_millis() as u64, "waiting for body");
                tokio::time::sleep(delay).await;
                Directive::Continue
            }
        }
    }

    // Runs the owning controller synchronously; `None` when nothing matches.
    fn step(
        &self,
        id: ConnectionId,
        queue: &mut (dyn ResponseQueue + Send),
        exchange: &Exchange<'_>,
    ) -> Option<Step> {
        let mut slot = match self.table.take(id) {
            Some(slot) => slot,
            None => {
                let controller = self.router.find(exchange.path(), exchange.method())?;
                Slot::new(Arc::clone(controller))
            }
        };
        let step = slot.controller.handle(exchange, &mut slot.state, queue);
        self.table.put(id, slot);
        Some(step)
    }

    /// Releases the exchange's state. Unknown ids are ignored.
    pub fn complete(&self, id: ConnectionId, reason: TerminationReason) {
        match self.table.take(id) {
            Some(slot) => {
                debug!(id = %id, reason = %reason, "exchange complete");
                slot.controller.on_complete(slot.state, reason);
            }
            None => trace!(id = %id, reason = %reason, "completion without state"),
        }
    }

    /// Releases every live exchange with the same reason.
    pub fn dispose_all(&self, reason: TerminationReason) {
        for (id, slot) in self.table.drain() {
            debug!(id = %id, reason = %reason, "exchange disposed");
            slot.controller.on_complete(slot.state, reason);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("access", &self.access)
            .field("live", &self.table.len())
            .finish()
    }
}

fn queue_status(queue: &mut (dyn ResponseQueue + Send), status: StatusCode) {
    if let Err(e) = queue.queue(Response::new(status)) {
        debug!(id = %queue.id(), status = %status, error = %e, "could not queue response");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::WaitPolicy;
    use crate::controller::{
        ConnectionState, Controller, MemoryQueue, ResponseParams, route,
    };
    use crate::http::{Method, RequestHead};

    const POLICY: WaitPolicy = WaitPolicy {
        poll_interval: Duration::from_millis(1),
        max_wait_loops: 2,
    };

    #[derive(Default)]
    struct Recorder {
        handled: AtomicUsize,
        completed: Mutex<Vec<TerminationReason>>,
    }

    impl Controller for Recorder {
        fn accepts(&self, path: &str, _method: &Method) -> bool {
            path == "/record"
        }

        fn handle(
            &self,
            _exchange: &Exchange<'_>,
            state: &mut ConnectionState,
            queue: &mut dyn ResponseQueue,
        ) -> Step {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if !state.is_sent() && queue.queue(Response::new(StatusCode::Ok)).is_ok() {
                state.mark_sent();
            }
            Step::Continue
        }

        fn on_complete(&self, _state: ConnectionState, reason: TerminationReason) {
            self.completed.lock().unwrap().push(reason);
        }
    }

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap().0
    }

    fn dispatcher(recorder: Arc<Recorder>, allowed: &[&str]) -> Dispatcher {
        let mut router = Router::new();
        router.add(recorder);
        router.add(Arc::new(route(Method::Get, "/", |_, out: &mut String| {
            out.push_str("home");
            ResponseParams::ok()
        })));
        router.add(Arc::new(route(Method::Post, "/submit", |req, out: &mut String| {
            out.push_str(req.body_text().unwrap_or_default());
            ResponseParams::ok()
        })));
        Dispatcher::new(router, AccessFilter::new(allowed.iter().copied()))
    }

    #[tokio::test]
    async fn forbidden_peer_never_reaches_controller() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&recorder), &["127.0.0.1"]);
        let h = head("GET /record HTTP/1.1\r\n\r\n");
        let mut q = MemoryQueue::new(1);

        let ex = Exchange::new(&h, "10.9.9.9", b"", true, POLICY);
        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Forbidden);
        assert_eq!(q.take().unwrap().status(), StatusCode::Forbidden);
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);
        assert_eq!(d.live(), 0);
    }

    #[tokio::test]
    async fn unmatched_request_gets_404_and_no_state() {
        let d = dispatcher(Arc::new(Recorder::default()), &["*"]);
        let h = head("GET /missing HTTP/1.1\r\n\r\n");
        let mut q = MemoryQueue::new(2);

        let ex = Exchange::new(&h, "127.0.0.1", b"", true, POLICY);
        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::NotFound);
        let response = q.take().unwrap();
        assert_eq!(response.status(), StatusCode::NotFound);
        assert!(response.body_ref().is_empty());
        assert_eq!(d.live(), 0);
    }

    #[tokio::test]
    async fn state_lives_until_completion() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&recorder), &["*"]);
        let h = head("GET /record HTTP/1.1\r\n\r\n");
        let mut q = MemoryQueue::new(3);
        let ex = Exchange::new(&h, "127.0.0.1", b"", true, POLICY);

        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Continue);
        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Continue);
        assert_eq!(d.live(), 1);
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 2);

        d.complete(q.id(), TerminationReason::Completed);
        assert_eq!(d.live(), 0);
        assert_eq!(*recorder.completed.lock().unwrap(), [TerminationReason::Completed]);

        d.complete(q.id(), TerminationReason::Completed);
        assert_eq!(recorder.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_body_waits_then_aborts() {
        let d = dispatcher(Arc::new(Recorder::default()), &["*"]);
        let h = head("POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\n");
        let mut q = MemoryQueue::new(4);
        let ex = Exchange::new(&h, "127.0.0.1", b"", false, POLICY);

        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Continue);
        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Continue);
        assert_eq!(d.dispatch(&mut q, &ex).await, Directive::Abort);
        assert!(q.queued().is_none());

        d.complete(q.id(), TerminationReason::Rejected);
        assert_eq!(d.live(), 0);
    }

    #[tokio::test]
    async fn silent_upload_is_dropped_once_wait_budget_elapses() {
        let policy = WaitPolicy {
            poll_interval: Duration::from_millis(20),
            max_wait_loops: 5,
        };
        let d = dispatcher(Arc::new(Recorder::default()), &["*"]);
        let h = head("POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\n");
        let mut q = MemoryQueue::new(9);
        let ex = Exchange::new(&h, "127.0.0.1", b"", false, policy);

        let started = tokio::time::Instant::now();
        let mut calls = 0;
        while d.dispatch(&mut q, &ex).await != Directive::Abort {
            calls += 1;
            assert!(calls <= policy.max_wait_loops, "wait budget never ran out");
        }
        let elapsed = started.elapsed();

        assert_eq!(calls, policy.max_wait_loops);
        assert!(elapsed >= policy.budget(), "dropped early: {elapsed:?}");
        assert!(
            elapsed < policy.budget() + Duration::from_millis(250),
            "dropped late: {elapsed:?}"
        );
        assert!(q.queued().is_none());
        d.complete(q.id(), TerminationReason::Rejected);
    }

    #[tokio::test]
    async fn body_arriving_in_chunks_reaches_responder() {
        let d = dispatcher(Arc::new(Recorder::default()), &["*"]);
        let h = head("POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        let mut q = MemoryQueue::new(5);

        let first = Exchange::new(&h, "127.0.0.1", b"he", false, POLICY);
        assert_eq!(d.dispatch(&mut q, &first).await, Directive::Continue);
        assert!(q.queued().is_none());

        let last = Exchange::new(&h, "127.0.0.1", b"llo", true, POLICY);
        assert_eq!(d.dispatch(&mut q, &last).await, Directive::Continue);
        assert_eq!(q.take().unwrap().body_ref(), b"hello");
    }

    #[tokio::test]
    async fn exchanges_are_isolated_by_id() {
        let d = dispatcher(Arc::new(Recorder::default()), &["*"]);
        let h = head("GET / HTTP/1.1\r\n\r\n");
        let ex = Exchange::new(&h, "127.0.0.1", b"", true, POLICY);

        let mut a = MemoryQueue::new(10);
        let mut b = MemoryQueue::new(11);
        d.dispatch(&mut a, &ex).await;
        d.dispatch(&mut b, &ex).await;
        assert_eq!(d.live(), 2);
        assert!(a.queued().is_some());
        assert!(b.queued().is_some());

        d.complete(a.id(), TerminationReason::Completed);
        assert_eq!(d.live(), 1);
    }

    #[tokio::test]
    async fn dispose_all_releases_every_exchange() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(Arc::clone(&recorder), &["*"]);
        let h = head("GET /record HTTP/1.1\r\n\r\n");
        let ex = Exchange::new(&h, "127.0.0.1", b"", true, POLICY);
        for id in 0..3 {
            d.dispatch(&mut MemoryQueue::new(id), &ex).await;
        }

        d.dispose_all(TerminationReason::DaemonShutdown);
        assert_eq!(d.live(), 0);
        assert_eq!(
            *recorder.completed.lock().unwrap(),
            [TerminationReason::DaemonShutdown; 3]
        );
    }
}
