//! Server configuration.
//!
//! [`ServerOptions`] is what the server runs with. [`Settings`] is its
//! serializable counterpart, loaded from JSON or from `CTLHTTPD_*` environment
//! variables and converted with [`Settings::into_options`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default listening port when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// How long a controller waits for a request body that has not arrived.
///
/// The exchange is dropped after `max_wait_loops` idle polls of
/// `poll_interval` each (10 ms × 300 ≈ 3 s by default). Only polls before
/// the first body byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_wait_loops: u32,
}

impl WaitPolicy {
    /// Total idle time before an exchange is dropped.
    pub fn budget(&self) -> Duration {
        self.poll_interval * self.max_wait_loops
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_wait_loops: 300,
        }
    }
}

/// Timing and size knobs. Tests shrink these to keep runs fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub wait: WaitPolicy,
    /// Bind/start attempts per `start_daemon` call.
    pub bind_attempts: u32,
    /// Pause between failed bind/start attempts.
    pub bind_backoff: Duration,
    /// Period of the supervisor's liveness / termination check.
    pub health_tick: Duration,
    /// Hard limit on one exchange, enforced by the engine.
    pub request_deadline: Duration,
    /// Largest accepted `Content-Length`.
    pub max_body_bytes: usize,
    /// How long `stop_daemon` lets in-flight connections wind down.
    pub shutdown_grace: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            wait: WaitPolicy::default(),
            bind_attempts: 12,
            bind_backoff: Duration::from_secs(5),
            health_tick: Duration::from_secs(1),
            request_deadline: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// PEM-encoded private key and certificate chain. Both or neither.
#[derive(Clone)]
pub struct TlsPem {
    pub key_pem: String,
    pub cert_pem: String,
}

impl TlsPem {
    pub fn new(key_pem: impl Into<String>, cert_pem: impl Into<String>) -> Self {
        Self {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
        }
    }
}

impl fmt::Debug for TlsPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPem")
            .field("key_pem", &"<redacted>")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

/// Polled by the supervisor once per health tick; `true` stops the server.
pub type TerminatePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Runtime options of a [`Server`](crate::Server).
///
/// Treated as immutable once serving starts.
#[derive(Clone)]
pub struct ServerOptions {
    /// Listen on the loopback address only. Takes precedence over
    /// `bind_address`.
    pub bind_loopback_only: bool,
    /// IPv4 dotted-decimal or textual IPv6 address to listen on.
    pub bind_address: Option<String>,
    /// OS network interface to bind the listener to (Linux only).
    pub bind_interface: Option<String>,
    pub tls_certificate: Option<TlsPem>,
    /// Literal peer addresses allowed to connect; `*` or `all` allows anyone.
    pub allowed_peers: Vec<String>,
    pub should_terminate: Option<TerminatePredicate>,
    pub tuning: Tuning,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_loopback_only: false,
            bind_address: None,
            bind_interface: None,
            tls_certificate: None,
            allowed_peers: vec!["*".to_owned()],
            should_terminate: None,
            tuning: Tuning::default(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("bind_loopback_only", &self.bind_loopback_only)
            .field("bind_address", &self.bind_address)
            .field("bind_interface", &self.bind_interface)
            .field("tls_certificate", &self.tls_certificate)
            .field("allowed_peers", &self.allowed_peers)
            .field("should_terminate", &self.should_terminate.is_some())
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl ServerOptions {
    /// Installs the termination predicate.
    pub fn terminate_when<F>(&mut self, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_terminate = Some(Arc::new(predicate));
    }

    /// The address the listener binds to.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when `bind_address` is not an IP address.
    pub fn bind_ip(&self) -> ServerResult<IpAddr> {
        if self.bind_loopback_only {
            return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        match self.bind_address.as_deref().map(str::trim) {
            None | Some("") => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Some(addr) => addr
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid bind address {addr:?}"))),
        }
    }

    /// Checks everything that must be right before the first bind.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for an unusable address, interface name or
    /// tuning value.
    pub fn validate(&self) -> ServerResult<()> {
        self.bind_ip()?;
        if let Some(iface) = &self.bind_interface {
            if iface.is_empty() || iface.contains('\0') {
                return Err(ServerError::Config(format!(
                    "invalid bind interface {iface:?}"
                )));
            }
        }
        if self.tuning.bind_attempts == 0 {
            return Err(ServerError::Config("bind_attempts must be at least 1".into()));
        }
        if self.tuning.health_tick.is_zero() {
            return Err(ServerError::Config("health_tick must be non-zero".into()));
        }
        Ok(())
    }
}

/// A settable flag usable as a termination predicate.
///
/// ```rust
/// use ctlhttpd::config::{ServerOptions, ShutdownFlag};
///
/// let flag = ShutdownFlag::new();
/// let mut options = ServerOptions::default();
/// options.should_terminate = Some(flag.predicate());
/// flag.trigger();
/// assert!((options.should_terminate.unwrap())());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn predicate(&self) -> TerminatePredicate {
        let flag = Arc::clone(&self.0);
        Arc::new(move || flag.load(Ordering::SeqCst))
    }
}

/// Serializable server settings.
///
/// Missing fields take their defaults, so a JSON document only lists what
/// differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub bind_loopback: bool,
    pub bind_address: Option<String>,
    pub bind_interface: Option<String>,
    pub allowed_peers: Vec<String>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub max_wait_loops: u32,
    pub bind_attempts: u32,
    pub bind_backoff_ms: u64,
    pub health_tick_ms: u64,
    pub request_deadline_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let tuning = Tuning::default();
        Self {
            port: DEFAULT_PORT,
            bind_loopback: false,
            bind_address: None,
            bind_interface: None,
            allowed_peers: vec!["*".to_owned()],
            tls_key_file: None,
            tls_cert_file: None,
            poll_interval_ms: millis(tuning.wait.poll_interval),
            max_wait_loops: tuning.wait.max_wait_loops,
            bind_attempts: tuning.bind_attempts,
            bind_backoff_ms: millis(tuning.bind_backoff),
            health_tick_ms: millis(tuning.health_tick),
            request_deadline_ms: millis(tuning.request_deadline),
            max_body_bytes: tuning.max_body_bytes,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Parses settings from a JSON document.
    ///
    /// # Errors
    ///
    /// [`ServerError::Settings`] when the document does not match.
    pub fn from_json(json: &str) -> ServerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads settings from `CTLHTTPD_*` environment variables on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when a numeric variable does not parse.
    pub fn from_env() -> ServerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let mut settings = Self::default();

        if let Some(v) = lookup("CTLHTTPD_PORT") {
            settings.port = parse_var("CTLHTTPD_PORT", &v)?;
        }
        if let Some(v) = lookup("CTLHTTPD_BIND_LOOPBACK") {
            settings.bind_loopback = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("CTLHTTPD_BIND_ADDRESS") {
            settings.bind_address = Some(v);
        }
        if let Some(v) = lookup("CTLHTTPD_BIND_INTERFACE") {
            settings.bind_interface = Some(v);
        }
        if let Some(v) = lookup("CTLHTTPD_ALLOWED_PEERS") {
            settings.allowed_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(v) = lookup("CTLHTTPD_TLS_KEY_FILE") {
            settings.tls_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CTLHTTPD_TLS_CERT_FILE") {
            settings.tls_cert_file = Some(PathBuf::from(v));
        }

        Ok(settings)
    }

    /// Converts into a port and [`ServerOptions`], reading TLS files.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when only one TLS file is given or a file
    /// cannot be read.
    pub fn into_options(self) -> ServerResult<(u16, ServerOptions)> {
        let tls_certificate = match (&self.tls_key_file, &self.tls_cert_file) {
            (None, None) => None,
            (Some(key), Some(cert)) => Some(TlsPem::new(read_pem(key)?, read_pem(cert)?)),
            _ => {
                return Err(ServerError::Config(
                    "TLS key and certificate must be configured together".into(),
                ));
            }
        };

        let options = ServerOptions {
            bind_loopback_only: self.bind_loopback,
            bind_address: self.bind_address,
            bind_interface: self.bind_interface,
            tls_certificate,
            allowed_peers: self.allowed_peers,
            should_terminate: None,
            tuning: Tuning {
                wait: WaitPolicy {
                    poll_interval: Duration::from_millis(self.poll_interval_ms),
                    max_wait_loops: self.max_wait_loops,
                },
                bind_attempts: self.bind_attempts,
                bind_backoff: Duration::from_millis(self.bind_backoff_ms),
                health_tick: Duration::from_millis(self.health_tick_ms),
                request_deadline: Duration::from_millis(self.request_deadline_ms),
                max_body_bytes: self.max_body_bytes,
                ..Tuning::default()
            },
        };
        Ok((self.port, options))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> ServerResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ServerError::Config(format!("{key}: cannot parse {value:?}")))
}

fn read_pem(path: &Path) -> ServerResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = ServerOptions::default();
        assert_eq!(options.allowed_peers, ["*"]);
        assert_eq!(options.tuning.wait.budget(), Duration::from_secs(3));
        assert_eq!(options.tuning.bind_attempts, 12);
        assert_eq!(options.tuning.bind_backoff, Duration::from_secs(5));
        assert_eq!(
            options.bind_ip().unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn loopback_wins_over_explicit_address() {
        let options = ServerOptions {
            bind_loopback_only: true,
            bind_address: Some("10.0.0.1".into()),
            ..ServerOptions::default()
        };
        assert_eq!(options.bind_ip().unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn ipv6_bind_address_is_accepted() {
        let options = ServerOptions {
            bind_address: Some("::1".into()),
            ..ServerOptions::default()
        };
        assert!(options.bind_ip().unwrap().is_ipv6());
    }

    #[test]
    fn bad_bind_address_fails_validation() {
        let options = ServerOptions {
            bind_address: Some("not-an-ip".into()),
            ..ServerOptions::default()
        };
        assert!(matches!(options.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn zero_attempts_fail_validation() {
        let mut options = ServerOptions::default();
        options.tuning.bind_attempts = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn settings_from_partial_json() {
        let settings =
            Settings::from_json(r#"{"port": 9090, "allowed_peers": ["10.1.1.1"], "max_wait_loops": 5}"#)
                .unwrap();
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.max_wait_loops, 5);
        assert_eq!(settings.poll_interval_ms, 10);

        let (port, options) = settings.into_options().unwrap();
        assert_eq!(port, 9090);
        assert_eq!(options.allowed_peers, ["10.1.1.1"]);
        assert_eq!(options.tuning.wait.max_wait_loops, 5);
    }

    #[test]
    fn settings_reject_wrong_types() {
        assert!(matches!(
            Settings::from_json(r#"{"port": "eighty"}"#),
            Err(ServerError::Settings(_))
        ));
    }

    #[test]
    fn settings_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CTLHTTPD_PORT", "8443"),
            ("CTLHTTPD_BIND_LOOPBACK", "true"),
            ("CTLHTTPD_ALLOWED_PEERS", "127.0.0.1, ::1,"),
        ]
        .into_iter()
        .collect();
        let settings =
            Settings::from_lookup(|k| vars.get(k).map(|v| (*v).to_owned())).unwrap();
        assert_eq!(settings.port, 8443);
        assert!(settings.bind_loopback);
        assert_eq!(settings.allowed_peers, ["127.0.0.1", "::1"]);
    }

    #[test]
    fn settings_bad_port_is_config_error() {
        let result = Settings::from_lookup(|k| (k == "CTLHTTPD_PORT").then(|| "70000".to_owned()));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn tls_files_must_come_in_pairs() {
        let settings = Settings {
            tls_key_file: Some(PathBuf::from("/nonexistent/key.pem")),
            ..Settings::default()
        };
        assert!(matches!(settings.into_options(), Err(ServerError::Config(_))));
    }

    #[test]
    fn shutdown_flag_drives_predicate() {
        let flag = ShutdownFlag::new();
        let predicate = flag.predicate();
        assert!(!predicate());
        flag.trigger();
        assert!(predicate());
        assert!(flag.is_triggered());
    }
}
