//! The embeddable server.
//!
//! A [`Server`] collects controllers and options, then hands them to a
//! [`Supervisor`] which keeps a listener daemon running until the termination
//! predicate fires.

use std::sync::Arc;

use crate::config::{ServerOptions, Settings};
use crate::controller::Controller;
use crate::error::ServerResult;
use crate::router::Router;
use crate::supervisor::Supervisor;

/// The ctlhttpd HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use ctlhttpd::controller::{ResponseParams, route};
/// use ctlhttpd::config::ShutdownFlag;
/// use ctlhttpd::http::Method;
/// use ctlhttpd::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let stop = ShutdownFlag::new();
///     let mut server = Server::new(8080);
///     server.options_mut().bind_loopback_only = true;
///     server.options_mut().should_terminate = Some(stop.predicate());
///     server.add_controller(route(Method::Get, "/", |_, out: &mut String| {
///         out.push_str("hello");
///         ResponseParams::ok()
///     }));
///     server.serve().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    port: u16,
    options: ServerOptions,
    router: Router,
}

impl Server {
    /// A server for `port` with default options and no controllers.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            options: ServerOptions::default(),
            router: Router::new(),
        }
    }

    /// A server configured from [`Settings`].
    ///
    /// # Errors
    ///
    /// Whatever [`Settings::into_options`] reports.
    pub fn from_settings(settings: Settings) -> ServerResult<Self> {
        let (port, options) = settings.into_options()?;
        Ok(Self::new(port).with_options(options))
    }

    #[must_use]
    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut ServerOptions {
        &mut self.options
    }

    /// Registers a controller behind every controller added before it.
    pub fn add_controller<C>(&mut self, controller: C) -> &mut Self
    where
        C: Controller + 'static,
    {
        self.router.add(Arc::new(controller));
        self
    }

    /// Registers a controller that is shared with other owners.
    pub fn add_shared(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.router.add(controller);
        self
    }

    /// Validates the configuration and builds the supervisor without starting
    /// anything.
    ///
    /// # Errors
    ///
    /// Configuration and TLS errors, as for [`Server::serve`].
    pub fn into_supervisor(self) -> ServerResult<Supervisor> {
        Supervisor::new(self.port, self.options, self.router)
    }

    /// Runs until the termination predicate returns `true`.
    ///
    /// Bind failures are retried and logged; a daemon that dies is restarted.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`](crate::ServerError::Config) or
    /// [`ServerError::Tls`](crate::ServerError::Tls) when the options are
    /// unusable. Nothing is bound in that case.
    pub async fn serve(self) -> ServerResult<()> {
        let mut supervisor = self.into_supervisor()?;
        supervisor.run().await;
        Ok(())
    }
}
