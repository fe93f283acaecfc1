//! # ctlhttpd
//!
//! An embeddable HTTP/1.1 server built around controllers.
//!
//! A host process registers [`Controller`](controller::Controller)s on a
//! [`Server`]; the first controller whose `accepts` matches a request's path
//! and method answers it. Controllers are re-entered once per observed chunk
//! of a request, which lets them wait for a body before rendering. A peer
//! allow-list guards every request, and a supervisor keeps the listener alive,
//! retrying binds and restarting a dead daemon until told to stop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ctlhttpd::Server;
//! use ctlhttpd::config::ShutdownFlag;
//! use ctlhttpd::controller::{ResponseParams, route};
//! use ctlhttpd::http::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stop = ShutdownFlag::new();
//!     let mut server = Server::new(8080);
//!     server.options_mut().should_terminate = Some(stop.predicate());
//!     server.add_controller(route(Method::Get, "/", |req, out: &mut String| {
//!         out.push_str("Hello from ");
//!         out.push_str(req.peer());
//!         ResponseParams::ok().header("Content-Type", "text/plain")
//!     }));
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod config;
pub mod controller;
pub mod dispatch;
mod engine;
pub mod error;
pub mod http;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod tls;

pub use config::{ServerOptions, Settings, ShutdownFlag};
pub use controller::{Controller, ResponseParams, StaticPage, route};
pub use error::{ServerError, ServerResult};
pub use http::{Headers, Method, Response, StatusCode};
pub use server::Server;
