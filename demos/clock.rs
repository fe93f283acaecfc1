//! Serves the current Unix time on `/` and echoes POST bodies on `/echo`.
//!
//! ```text
//! CTLHTTPD_PORT=8080 CTLHTTPD_BIND_LOOPBACK=1 cargo run --example clock
//! curl http://127.0.0.1:8080/
//! curl -d 'hi there' http://127.0.0.1:8080/echo
//! ```
//!
//! Ctrl-C stops the server on the next health tick.

use std::time::{SystemTime, UNIX_EPOCH};

use ctlhttpd::config::{Settings, ShutdownFlag};
use ctlhttpd::controller::{ResponseParams, StaticPage, route};
use ctlhttpd::http::{Method, StatusCode};
use ctlhttpd::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ctlhttpd=debug")),
        )
        .init();

    let stop = ShutdownFlag::new();
    let mut server = Server::from_settings(Settings::from_env()?)?;
    server.options_mut().should_terminate = Some(stop.predicate());

    server
        .add_controller(route(Method::Get, "/", |req, out: &mut String| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            out.push_str(&format!(
                "<html><body><h1>{now}</h1><p>served to {}</p></body></html>",
                req.peer()
            ));
            ResponseParams::ok().header("Content-Type", "text/html; charset=utf-8")
        }))
        .add_controller(route(Method::Post, "/echo", |req, out: &mut String| {
            match req.body_text() {
                Some(text) => {
                    out.push_str(text);
                    ResponseParams::ok()
                }
                None => ResponseParams::new(StatusCode::UnsupportedMediaType)
                    .message("body is not UTF-8"),
            }
        }))
        .add_controller(StaticPage::new(Method::Get, "/healthz", "ok"));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.trigger();
        }
    });

    server.serve().await?;
    Ok(())
}
