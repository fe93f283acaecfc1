//! Listener daemon supervision.
//!
//! The [`Supervisor`] owns at most one running daemon: a bound listener and
//! the engine task accepting on it. Binding is retried with a fixed backoff,
//! and [`Supervisor::run`] restarts the daemon whenever it stops being alive
//! until the termination predicate says otherwise.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::access::AccessFilter;
use crate::config::ServerOptions;
use crate::controller::TerminationReason;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::error::{ServerError, ServerResult};
use crate::router::Router;
use crate::tls;

const LISTEN_BACKLOG: i32 = 1024;

struct Daemon {
    // Duplicate handle on the listening socket, used by `is_alive`.
    socket: Socket,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Starts, watches and restarts the listener daemon.
pub struct Supervisor {
    port: u16,
    options: Arc<ServerOptions>,
    dispatcher: Arc<Dispatcher>,
    tls: Option<TlsAcceptor>,
    daemon: Option<Daemon>,
}

impl Supervisor {
    /// Validates the options and prepares, but does not start, a daemon.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`](crate::ServerError::Config) for an unusable
    /// bind address and [`ServerError::Tls`](crate::ServerError::Tls) for a
    /// bad key or certificate. These are never retried.
    pub fn new(port: u16, options: ServerOptions, router: Router) -> ServerResult<Self> {
        options.validate()?;
        let tls = options.tls_certificate.as_ref().map(tls::acceptor).transpose()?;
        let access = AccessFilter::new(options.allowed_peers.iter().cloned());
        Ok(Self {
            port,
            options: Arc::new(options),
            dispatcher: Arc::new(Dispatcher::new(router, access)),
            tls,
            daemon: None,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Address of the running daemon's listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.daemon.as_ref().map(|d| d.local_addr)
    }

    /// `true` while a daemon exists, its engine is still accepting and its
    /// socket is still open.
    pub fn is_alive(&self) -> bool {
        self.daemon
            .as_ref()
            .is_some_and(|d| !d.task.is_finished() && d.socket.local_addr().is_ok())
    }

    /// (Re)starts the daemon, stopping any existing one first.
    ///
    /// Binding is attempted up to `bind_attempts` times, sleeping
    /// `bind_backoff` between failures. Returns `false` when every attempt
    /// failed; the failure is logged, never returned.
    pub async fn start_daemon(&mut self) -> bool {
        self.stop_daemon().await;

        let ip = match self.options.bind_ip() {
            Ok(ip) => ip,
            Err(e) => {
                error!(error = %e, "cannot resolve bind address");
                return false;
            }
        };
        let addr = SocketAddr::new(ip, self.port);
        let attempts = self.options.tuning.bind_attempts;
        let backoff = self.options.tuning.bind_backoff;

        for attempt in 1..=attempts {
            match self.listen(addr) {
                Ok((listener, socket)) => {
                    let local_addr = listener.local_addr().unwrap_or(addr);
                    let (shutdown, rx) = watch::channel(false);
                    let engine = Engine::new(
                        listener,
                        Arc::clone(&self.dispatcher),
                        Arc::clone(&self.options),
                        self.tls.clone(),
                    );
                    let task = tokio::spawn(engine.run(rx));
                    info!(address = %local_addr, attempt, "daemon started");
                    self.daemon = Some(Daemon {
                        socket,
                        task,
                        shutdown,
                        local_addr,
                    });
                    return true;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "daemon start failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!(address = %addr, attempts, "giving up on starting the daemon");
        false
    }

    /// Binds and listens on `addr`, returning the tokio listener and a
    /// duplicate handle on the same socket.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] naming `addr` when any socket step fails.
    pub(crate) fn listen(&self, addr: SocketAddr) -> ServerResult<(TcpListener, Socket)> {
        let open = || -> io::Result<(TcpListener, Socket)> {
            let socket =
                Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            if let Some(iface) = &self.options.bind_interface {
                bind_to_interface(&socket, iface)?;
            }
            socket.bind(&addr.into())?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;

            let handle = socket.try_clone()?;
            let std_listener: std::net::TcpListener = socket.into();
            Ok((TcpListener::from_std(std_listener)?, handle))
        };
        open().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Stops the daemon if one is running.
    ///
    /// In-flight connections get `shutdown_grace` to finish; whatever is
    /// left is aborted and its state released with
    /// [`TerminationReason::DaemonShutdown`]. The engine task has finished
    /// by the time this returns.
    pub async fn stop_daemon(&mut self) {
        let Some(Daemon {
            socket,
            mut task,
            shutdown,
            local_addr,
        }) = self.daemon.take()
        else {
            return;
        };

        let _ = shutdown.send(true);
        // The engine bounds its own drain by the grace; the extra grace here
        // only covers an engine that stopped making progress.
        let limit = self.options.tuning.shutdown_grace.saturating_mul(2);
        match timeout(limit, &mut task).await {
            Ok(_) => debug!(address = %local_addr, "engine drained"),
            Err(_) => {
                warn!(address = %local_addr, "engine unresponsive, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        drop(socket);
        self.dispatcher.dispose_all(TerminationReason::DaemonShutdown);
        info!(address = %local_addr, "daemon stopped");
    }

    fn should_terminate(&self) -> bool {
        self.options.should_terminate.as_ref().is_some_and(|f| f())
    }

    /// Keeps the daemon alive until the termination predicate fires.
    ///
    /// Checks once per `health_tick`: a dead daemon is restarted, then the
    /// predicate is evaluated. Without a predicate this never returns.
    pub async fn run(&mut self) {
        self.start_daemon().await;

        let mut tick = tokio::time::interval(self.options.tuning.health_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tick.tick().await;
            if !self.is_alive() {
                warn!(port = self.port, "daemon not alive, restarting");
                self.start_daemon().await;
            }
            if self.should_terminate() {
                info!(port = self.port, "termination requested");
                break;
            }
        }

        self.stop_daemon().await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown.send(true);
            daemon.task.abort();
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_interface(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_interface(_socket: &Socket, iface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {iface:?} is not supported on this platform"),
    ))
}
