//! Connection engine.
//!
//! Accepts TCP connections (optionally wrapped in TLS), parses HTTP/1.1 request
//! heads and drives each exchange through the [`Dispatcher`] until a response
//! is written or the exchange ends some other way. Connections are persistent
//! when the client asks for it and the request body was fully consumed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerOptions;
use crate::controller::{ConnectionId, Exchange, QueueError, ResponseQueue, TerminationReason};
use crate::dispatch::{Directive, Dispatcher};
use crate::http::{HeadError, RequestHead, Response, StatusCode};

/// Largest request head we buffer before answering `431`.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Accept failures in a row after which the accept loop gives up.
pub(crate) const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 64;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

static NEXT_EXCHANGE: AtomicU64 = AtomicU64::new(1);

fn next_exchange_id() -> ConnectionId {
    ConnectionId::new(NEXT_EXCHANGE.fetch_add(1, Ordering::Relaxed))
}

/// Resolves once shutdown was requested or the sender went away.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Textual peer address as seen by the access filter.
pub(crate) fn peer_string(addr: &SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}

/// A bound listener plus everything needed to serve it.
pub(crate) struct Engine {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    options: Arc<ServerOptions>,
    tls: Option<TlsAcceptor>,
}

impl Engine {
    pub(crate) fn new(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        options: Arc<ServerOptions>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            options,
            tls,
        }
    }

    /// Accepts connections until shutdown is requested, then drains them.
    ///
    /// Returns early, without draining, after
    /// [`MAX_CONSECUTIVE_ACCEPT_ERRORS`] failed accepts in a row.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local = self.listener.local_addr().ok();
        info!(
            address = ?local,
            tls = self.tls.is_some(),
            "engine accepting connections"
        );

        let mut connections = JoinSet::new();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;

                () = shutdown_requested(&mut shutdown) => {
                    info!(in_flight = connections.len(), "shutdown requested, draining connections");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        failures = 0;
                        connections.spawn(serve_tcp(
                            stream,
                            addr,
                            Arc::clone(&self.dispatcher),
                            Arc::clone(&self.options),
                            self.tls.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "accept failed");
                        if failures >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                            error!(failures, "too many accept failures, engine stopping");
                            connections.shutdown().await;
                            return;
                        }
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.options.tuning.shutdown_grace, drain).await.is_err() {
            warn!(in_flight = connections.len(), "shutdown grace elapsed, aborting connections");
            connections.shutdown().await;
        }
        info!(address = ?local, "engine stopped");
    }
}

async fn serve_tcp(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    options: Arc<ServerOptions>,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
) {
    let peer = peer_string(&addr);
    debug!(peer = %peer, "connection accepted");
    let _ = stream.set_nodelay(true);

    match tls {
        None => {
            Connection::new(stream, peer, dispatcher, options)
                .serve(shutdown)
                .await;
        }
        Some(acceptor) => {
            let deadline = options.tuning.request_deadline;
            match timeout(deadline, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => {
                    Connection::new(stream, peer, dispatcher, options)
                        .serve(shutdown)
                        .await;
                }
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        }
    }
}

/// Per-exchange response slot handed to controllers.
#[derive(Debug)]
struct PendingResponse {
    id: ConnectionId,
    response: Option<Response>,
}

impl PendingResponse {
    fn new(id: ConnectionId) -> Self {
        Self { id, response: None }
    }

    fn take(&mut self) -> Option<Response> {
        self.response.take()
    }
}

impl ResponseQueue for PendingResponse {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn queue(&mut self, response: Response) -> Result<(), QueueError> {
        if self.response.is_some() {
            return Err(QueueError::AlreadyQueued);
        }
        self.response = Some(response);
        Ok(())
    }
}

enum HeadRead {
    Ready(RequestHead, usize),
    Closed,
    TooLarge,
    Malformed(HeadError),
}

/// How an exchange ended and whether the connection may carry another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    reason: TerminationReason,
    keep_alive: bool,
}

impl Outcome {
    fn closed(reason: TerminationReason) -> Self {
        Self {
            reason,
            keep_alive: false,
        }
    }
}

struct Connection<S> {
    stream: S,
    peer: String,
    buf: BytesMut,
    dispatcher: Arc<Dispatcher>,
    options: Arc<ServerOptions>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, peer: String, dispatcher: Arc<Dispatcher>, options: Arc<ServerOptions>) -> Self {
        Self {
            stream,
            peer,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            dispatcher,
            options,
        }
    }

    async fn serve(mut self, mut shutdown: watch::Receiver<bool>) {
        let deadline = self.options.tuning.request_deadline;

        loop {
            let read = tokio::select! {
                () = shutdown_requested(&mut shutdown) => return,
                read = timeout(deadline, self.read_head()) => read,
            };

            let (head, head_len) = match read {
                Ok(Ok(HeadRead::Ready(head, len))) => (head, len),
                Ok(Ok(HeadRead::Closed)) => {
                    debug!(peer = %self.peer, "connection closed by peer");
                    return;
                }
                Ok(Ok(HeadRead::TooLarge)) => {
                    return self.reject(StatusCode::RequestHeaderFieldsTooLarge).await;
                }
                Ok(Ok(HeadRead::Malformed(e))) => {
                    debug!(peer = %self.peer, error = %e, "malformed request head");
                    return self.reject(StatusCode::BadRequest).await;
                }
                Ok(Err(e)) => {
                    debug!(peer = %self.peer, error = %e, "read failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %self.peer, "idle connection timed out");
                    return;
                }
            };
            let _ = self.buf.split_to(head_len);

            if head.is_chunked() {
                return self.reject(StatusCode::NotImplemented).await;
            }
            let content_length = match head.content_length() {
                Ok(len) => len.unwrap_or(0),
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "bad content length");
                    return self.reject(StatusCode::BadRequest).await;
                }
            };
            if content_length > self.options.tuning.max_body_bytes {
                return self.reject(StatusCode::PayloadTooLarge).await;
            }

            let id = next_exchange_id();
            debug!(
                id = %id,
                peer = %self.peer,
                method = %head.method(),
                path = %head.path(),
                "exchange started"
            );

            let outcome = tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    Outcome::closed(TerminationReason::DaemonShutdown)
                }
                done = timeout(deadline, self.exchange(id, &head, content_length)) => {
                    done.unwrap_or(Outcome::closed(TerminationReason::TimedOut))
                }
            };
            self.dispatcher.complete(id, outcome.reason);

            if !outcome.keep_alive {
                debug!(id = %id, reason = %outcome.reason, "closing connection");
                return;
            }
        }
    }

    async fn read_head(&mut self) -> io::Result<HeadRead> {
        loop {
            if !self.buf.is_empty() {
                match RequestHead::parse(&self.buf) {
                    Ok((head, len)) => return Ok(HeadRead::Ready(head, len)),
                    Err(HeadError::Incomplete) => {}
                    Err(e) => return Ok(HeadRead::Malformed(e)),
                }
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Ok(HeadRead::TooLarge);
                }
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(HeadRead::Closed);
            }
        }
    }

    async fn exchange(&mut self, id: ConnectionId, head: &RequestHead, content_length: usize) -> Outcome {
        let wait = self.options.tuning.wait;
        let mut queue = PendingResponse::new(id);
        let mut remaining = content_length;

        loop {
            let take = remaining.min(self.buf.len());
            let chunk = self.buf.split_to(take).freeze();
            remaining -= take;

            let exchange = Exchange::new(head, &self.peer, &chunk, remaining == 0, wait);
            if self.dispatcher.dispatch(&mut queue, &exchange).await == Directive::Abort {
                debug!(id = %id, peer = %self.peer, "exchange aborted");
                return Outcome::closed(TerminationReason::Rejected);
            }

            if let Some(response) = queue.take() {
                let keep_alive = head.is_keep_alive() && remaining == 0;
                return match self.write(response.keep_alive(keep_alive)).await {
                    Ok(()) => Outcome {
                        reason: TerminationReason::Completed,
                        keep_alive,
                    },
                    Err(e) => {
                        warn!(id = %id, peer = %self.peer, error = %e, "response write failed");
                        Outcome::closed(TerminationReason::Error)
                    }
                };
            }

            if remaining == 0 {
                tokio::time::sleep(wait.poll_interval).await;
                continue;
            }

            // Pick up whatever body bytes are already available without
            // blocking; the controller decides how long to wait for more.
            match timeout(Duration::ZERO, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return Outcome::closed(TerminationReason::ClientAborted),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(id = %id, peer = %self.peer, error = %e, "body read failed");
                    return Outcome::closed(TerminationReason::Error);
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    async fn write(&mut self, response: Response) -> io::Result<()> {
        self.stream.write_all(&response.into_bytes()).await?;
        self.stream.flush().await
    }

    async fn reject(&mut self, status: StatusCode) {
        debug!(peer = %self.peer, status = %status, "rejecting request");
        let response = Response::new(status)
            .body(status.canonical_reason())
            .keep_alive(false);
        if let Err(e) = self.write(response).await {
            debug!(peer = %self.peer, error = %e, "failed to write rejection");
        }
    }
}
