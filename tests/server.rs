//! End-to-end tests over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ctlhttpd::config::{ServerOptions, ShutdownFlag, WaitPolicy};
use ctlhttpd::controller::{ResponseParams, route};
use ctlhttpd::http::{Method, StatusCode};
use ctlhttpd::supervisor::Supervisor;
use ctlhttpd::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn options(allowed: &[&str]) -> ServerOptions {
    let mut options = ServerOptions {
        bind_loopback_only: true,
        allowed_peers: allowed.iter().map(|s| (*s).to_owned()).collect(),
        ..ServerOptions::default()
    };
    options.tuning.wait = WaitPolicy {
        poll_interval: Duration::from_millis(5),
        max_wait_loops: 10,
    };
    options.tuning.bind_backoff = Duration::from_millis(20);
    options.tuning.health_tick = Duration::from_millis(20);
    options.tuning.shutdown_grace = Duration::from_millis(500);
    options
}

fn server(allowed: &[&str], hits: Arc<AtomicUsize>) -> Server {
    let mut server = Server::new(0).with_options(options(allowed));
    server
        .add_controller(route(Method::Get, "/", move |_, out: &mut String| {
            hits.fetch_add(1, Ordering::SeqCst);
            out.push_str("<h1>clock</h1>");
            ResponseParams::ok().header("Content-Type", "text/html")
        }))
        .add_controller(route(Method::Post, "/echo", |req, out: &mut String| {
            out.push_str(req.body_text().unwrap_or_default());
            ResponseParams::new(StatusCode::Created)
        }))
        .add_controller(route(Method::Get, "/deny", |_, _: &mut String| {
            ResponseParams::abort()
        }));
    server
}

async fn started(allowed: &[&str]) -> (Supervisor, SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut sup = server(allowed, Arc::clone(&hits)).into_supervisor().unwrap();
    assert!(sup.start_daemon().await);
    let addr = sup.local_addr().unwrap();
    (sup, addr, hits)
}

async fn send(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn get_root_returns_controller_body() {
    let (mut sup, addr, hits) = started(&["*"]).await;

    let out = send(addr, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Type: text/html\r\n"));
    assert!(out.ends_with("<h1>clock</h1>"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    sup.stop_daemon().await;
}

#[tokio::test]
async fn unknown_path_is_404_with_empty_body() {
    let (mut sup, addr, _) = started(&["*"]).await;

    let out = send(addr, b"GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.ends_with("Content-Length: 0\r\n\r\n"));
    assert_eq!(sup.dispatcher().live(), 0);

    sup.stop_daemon().await;
}

#[tokio::test]
async fn disallowed_peer_gets_403_and_controller_never_runs() {
    let (mut sup, addr, hits) = started(&["192.0.2.1"]).await;

    let out = send(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(out.ends_with("Content-Length: 0\r\n\r\n"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    sup.stop_daemon().await;
}

#[tokio::test]
async fn loopback_literal_is_allowed() {
    let (mut sup, addr, _) = started(&["127.0.0.1"]).await;

    let out = send(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));

    sup.stop_daemon().await;
}

#[tokio::test]
async fn post_body_reaches_responder() {
    let (mut sup, addr, _) = started(&["*"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    stream.write_all(b" world").await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(out.ends_with("hello world"));

    sup.stop_daemon().await;
}

#[tokio::test]
async fn post_without_body_is_dropped_after_wait_budget() {
    let (mut sup, addr, _) = started(&["*"]).await;

    let budget = options(&["*"]).tuning.wait.budget();
    let started = tokio::time::Instant::now();
    let out = send(addr, b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\n").await;
    let elapsed = started.elapsed();
    assert!(out.is_empty());
    assert!(elapsed >= budget, "dropped before the wait budget: {elapsed:?}");
    assert!(elapsed < budget + Duration::from_secs(1), "dropped late: {elapsed:?}");
    assert_eq!(sup.dispatcher().live(), 0);

    sup.stop_daemon().await;
}

#[tokio::test]
async fn trickled_body_outlasting_wait_budget_is_answered() {
    let (mut sup, addr, _) = started(&["*"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 6\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    // Six bytes 20ms apart take well over the 50ms wait budget.
    for byte in b"trickl".chunks(1) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(byte).await.unwrap();
    }

    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.starts_with("HTTP/1.1 201 Created\r\n"), "{out}");
    assert!(out.ends_with("trickl"));

    sup.stop_daemon().await;
}

#[tokio::test]
async fn abort_sentinel_drops_connection() {
    let (mut sup, addr, _) = started(&["*"]).await;

    let out = send(addr, b"GET /deny HTTP/1.1\r\n\r\n").await;
    assert!(out.is_empty());

    sup.stop_daemon().await;
}

#[tokio::test]
async fn keep_alive_connection_serves_two_exchanges() {
    let (mut sup, addr, hits) = started(&["*"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = vec![0; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("Connection: keep-alive"));

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(String::from_utf8(rest).unwrap().starts_with("HTTP/1.1 200 OK"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    sup.stop_daemon().await;
}

#[tokio::test]
async fn serve_stops_when_flag_is_set() {
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let stop = ShutdownFlag::new();
    let mut server = Server::new(port).with_options(options(&["*"]));
    server.options_mut().should_terminate = Some(stop.predicate());
    server.add_controller(route(Method::Get, "/", |_, out: &mut String| {
        out.push_str("up");
        ResponseParams::ok()
    }));
    let running = tokio::spawn(server.serve());

    let mut up = false;
    for _ in 0..100 {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut out = String::new();
            stream.read_to_string(&mut out).await.unwrap();
            up = out.ends_with("up");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(up);

    stop.trigger();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("serve did not return")
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
