//! Run configuration: the immutable description of one load-generation run,
//! plus the small parsers behind the CLI surface (durations, rates, headers).
//!
//! Everything here is validated at startup; a failure is a [`ConfigError`]
//! printed to stderr with exit code 1, never a mid-run fault.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hyper::http::uri::Scheme;
use hyper::{Method, Uri};
use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid target URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("invalid header '{0}': expected 'Name: Value'")]
    InvalidHeader(String),

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("invalid rate '{value}': {message}")]
    InvalidRate { value: String, message: String },

    #[error("TLS configuration incomplete: --cert and --key must be set together, or neither")]
    IncompleteTls,

    #[error("failed to read TLS material from '{path}': {message}")]
    TlsRead { path: String, message: String },

    #[error("--requests ({requests}) must be at least --concurrency ({concurrency})")]
    RequestsBelowConcurrency { requests: u64, concurrency: u64 },

    #[error("failed to read body file '{path}': {message}")]
    BodyFile { path: String, message: String },

    #[error("failed to bind chart server on {addr}: {message}")]
    ChartBind { addr: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// Request body source, fixed for the whole run.
#[derive(Debug, Clone, Default)]
pub enum BodySource {
    #[default]
    None,
    /// In-memory bytes attached to every request.
    Bytes(hyper::body::Bytes),
    /// File opened per request and streamed chunked.
    File(PathBuf),
}

/// Requests-per-second limit parsed from `--rate`.
///
/// Accepted forms: `N` (per second), `N/unit` with unit one of
/// ns|us|µs|ms|s|m|h, `N/<duration>` (e.g. `100/500ms`), and `infinity`.
/// `0` means infinity. The canonical rendering re-parses to itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    Infinity,
    Per { count: f64, per: Duration },
}

impl Rate {
    /// Limit in requests per second, `None` when unbounded.
    pub fn rps(&self) -> Option<f64> {
        match *self {
            Rate::Infinity => None,
            Rate::Per { count, per } => Some(count / per.as_secs_f64()),
        }
    }
}

impl FromStr for Rate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinity") {
            return Ok(Rate::Infinity);
        }
        let err = |message: &str| ConfigError::InvalidRate {
            value: s.to_string(),
            message: message.to_string(),
        };
        let (count_str, per) = match s.split_once('/') {
            None => (s, Duration::from_secs(1)),
            Some((n, d)) => {
                // A bare unit after the slash means "per one of that unit".
                let d = d.trim();
                let per = if d.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    parse_duration(d).map_err(|m| err(&m))?
                } else {
                    parse_duration(&format!("1{}", d)).map_err(|m| err(&m))?
                };
                (n, per)
            }
        };
        let count: f64 = count_str
            .trim()
            .parse()
            .map_err(|_| err("count is not a number"))?;
        if !count.is_finite() || count < 0.0 {
            return Err(err("count must be a non-negative finite number"));
        }
        if per.is_zero() {
            return Err(err("period must be positive"));
        }
        if count == 0.0 {
            return Ok(Rate::Infinity);
        }
        Ok(Rate::Per { count, per })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Rate::Infinity => write!(f, "infinity"),
            Rate::Per { count, per } => write!(f, "{}/{}", count, format_duration(per)),
        }
    }
}

/// Parses durations like `200ms`, `1.5s`, `300us`, `2m`, `1h`.
///
/// Supported units: ns, us, µs, ms, s, m, h, d.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    const UNITS: [(&str, f64); 8] = [
        ("ns", 1e-9),
        ("us", 1e-6),
        ("µs", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
        ("d", 86_400.0),
    ];
    for (suffix, scale) in UNITS {
        if let Some(value_str) = s.strip_suffix(suffix) {
            // "ms" also ends in "s"; only accept when the remainder is numeric.
            let value: f64 = match value_str.trim().parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if !value.is_finite() || value < 0.0 {
                return Err(format!("invalid numeric value in duration: '{}'", value_str));
            }
            return Ok(Duration::from_secs_f64(value * scale));
        }
    }
    Err(format!(
        "unknown duration unit in '{}'; use ns, us, ms, s, m, h or d",
        s
    ))
}

/// Canonical rendering accepted back by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns == 0 {
        return "0s".to_string();
    }
    for (unit, scale) in [
        ("h", 3_600_000_000_000u128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if ns % scale == 0 {
            return format!("{}{}", ns / scale, unit);
        }
    }
    format!("{}ns", ns)
}

/// Splits one `Name: Value` CLI header into an owned pair.
///
/// Duplicates are allowed and preserved in order by the caller.
pub fn parse_header(s: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader(s.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidHeader(s.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Immutable description of one run. Built once at startup and shared.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: Uri,
    pub method: Method,
    /// Ordered name/value pairs; duplicates preserved.
    pub headers: Vec<(String, String)>,
    pub body: BodySource,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub insecure: bool,
    /// Concurrency level C; also the connection cap of the shared client.
    pub concurrency: u64,
    /// Total request bound N; 0 means unbounded.
    pub requests: u64,
    /// Wall-clock bound D.
    pub duration: Option<Duration>,
    pub rate: Rate,
    /// Caps one issue+drain cycle; `None` means unbounded.
    pub request_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub socks5: Option<String>,
    pub host_header: Option<String>,
    pub content_type: Option<String>,
}

impl RunConfig {
    /// Enforces the construction-time invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target()?;
        if self.concurrency < 1 {
            return Err(ConfigError::Invalid(
                "--concurrency must be at least 1".to_string(),
            ));
        }
        if self.requests > 0 && self.requests < self.concurrency {
            return Err(ConfigError::RequestsBelowConcurrency {
                requests: self.requests,
                concurrency: self.concurrency,
            });
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        if let Some(d) = self.duration {
            if d.is_zero() {
                return Err(ConfigError::Invalid(
                    "--duration must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Scheme, host and port of the single target, with 80/443 defaults.
    pub fn target(&self) -> Result<Target, ConfigError> {
        let err = |message: &str| ConfigError::InvalidUrl {
            url: self.url.to_string(),
            message: message.to_string(),
        };
        let scheme = self.url.scheme().cloned().unwrap_or(Scheme::HTTP);
        let tls = if scheme == Scheme::HTTPS {
            true
        } else if scheme == Scheme::HTTP {
            false
        } else {
            return Err(err("scheme must be http or https"));
        };
        let host = self
            .url
            .host()
            .ok_or_else(|| err("missing host"))?
            .to_string();
        let port = self.url.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Target { tls, host, port })
    }

    /// SOCKS5 proxy address with the `socks5://` scheme stripped; bare
    /// `host:port` is accepted as-is.
    pub fn socks5_addr(&self) -> Option<String> {
        self.socks5.as_ref().map(|s| {
            s.strip_prefix("socks5://")
                .unwrap_or(s.as_str())
                .to_string()
        })
    }

    /// Bounded record-queue capacity: min(100 * C, 8192).
    pub fn queue_capacity(&self) -> usize {
        (100 * self.concurrency as usize).min(8192)
    }
}

/// Resolved connection target of the run.
#[derive(Debug, Clone)]
pub struct Target {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
