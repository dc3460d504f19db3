//! HTTP client provisioning.
//!
//! Builds the single connection-pooled client every worker shares: a custom
//! dialer (TCP or SOCKS5, dial timeout, byte accounting, optional rustls
//! handshake) plugged into hyper's pool, plus the immutable request template
//! (method, URI, Host override, Content-Type, custom headers) that workers
//! stamp onto every request.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::client::connect::{Connected, Connection};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Body, Client, Method, Uri};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tower::Service;
use tracing::debug;

use crate::config::{ConfigError, RunConfig};
use crate::transport::{ByteCounters, CountedStream};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The pooled client all workers share.
pub type HttpClient = Client<Dialer, Body>;

/// A dialed connection: counted TCP, optionally with TLS on top.
pub enum TargetStream {
    Plain(CountedStream<TcpStream>),
    Tls(Box<TlsStream<CountedStream<TcpStream>>>),
}

impl AsyncRead for TargetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TargetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TargetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TargetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TargetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TargetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TargetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for TargetStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[derive(Clone)]
struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Dial function of the run: always connects to the configured target,
/// through SOCKS5 or an environment-configured HTTP proxy when set, wraps
/// the socket in the byte-accounting layer and finishes the TLS handshake
/// for https targets.
#[derive(Clone)]
pub struct Dialer {
    addr: String,
    socks5: Option<String>,
    http_proxy: Option<String>,
    dial_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    counters: ByteCounters,
    tls: Option<TlsContext>,
}

impl Dialer {
    async fn dial(self) -> Result<TargetStream, BoxError> {
        let connect = async {
            let tcp = match (&self.socks5, &self.http_proxy) {
                (Some(proxy), _) => {
                    debug!(proxy = %proxy, target = %self.addr, "dialing through socks5");
                    Socks5Stream::connect(proxy.as_str(), self.addr.clone())
                        .await?
                        .into_inner()
                }
                (None, Some(proxy)) => {
                    debug!(proxy = %proxy, target = %self.addr, "tunneling through http proxy");
                    let mut tcp = TcpStream::connect(proxy).await?;
                    connect_tunnel(&mut tcp, &self.addr).await?;
                    tcp
                }
                (None, None) => TcpStream::connect(&self.addr).await?,
            };
            Ok::<TcpStream, BoxError>(tcp)
        };
        let tcp = match self.dial_timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??,
            None => connect.await?,
        };
        let _ = tcp.set_nodelay(true);
        let counted = CountedStream::new(
            tcp,
            self.counters.clone(),
            self.read_timeout,
            self.write_timeout,
        );
        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), counted)
                    .await?;
                Ok(TargetStream::Tls(Box::new(stream)))
            }
            None => Ok(TargetStream::Plain(counted)),
        }
    }
}

impl Service<Uri> for Dialer {
    type Response = TargetStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TargetStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    // The client is bound to one host; the URI the pool hands back is
    // always the configured target, so the dialer ignores it.
    fn call(&mut self, _dst: Uri) -> Self::Future {
        Box::pin(self.clone().dial())
    }
}

/// Issues a CONNECT handshake on a freshly dialed proxy connection.
async fn connect_tunnel(stream: &mut TcpStream, target: &str) -> io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        head.push(byte[0]);
        if head.len() > 8192 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response head",
            ));
        }
    }
    let head = String::from_utf8_lossy(&head);
    let accepted = head
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !accepted {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "proxy refused CONNECT: {}",
                head.lines().next().unwrap_or("")
            ),
        ));
    }
    Ok(())
}

/// `host:port` of the HTTP proxy configured in the standard environment
/// variables for this scheme, unless NO_PROXY covers the host.
fn proxy_from_env(tls: bool, host: &str) -> Option<String> {
    let no_proxy = std::env::var("NO_PROXY")
        .or_else(|_| std::env::var("no_proxy"))
        .unwrap_or_default();
    if no_proxy_matches(&no_proxy, host) {
        return None;
    }
    let names: [&str; 2] = if tls {
        ["HTTPS_PROXY", "https_proxy"]
    } else {
        ["HTTP_PROXY", "http_proxy"]
    };
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
        .and_then(|value| proxy_authority(&value))
}

fn no_proxy_matches(no_proxy: &str, host: &str) -> bool {
    no_proxy.split(',').map(str::trim).any(|pattern| {
        !pattern.is_empty()
            && (pattern == "*"
                || host == pattern
                || host.ends_with(&format!(".{}", pattern.trim_start_matches('.'))))
    })
}

/// Reduces a proxy URL like `http://proxy.local:3128` to `host:port`,
/// defaulting to port 80.
fn proxy_authority(value: &str) -> Option<String> {
    let uri: Uri = value.parse().ok()?;
    let host = uri.host()?;
    Some(format!("{}:{}", host, uri.port_u16().unwrap_or(80)))
}

/// Builds the shared client and the counter pair its connections feed.
pub fn build_client(config: &RunConfig) -> Result<(HttpClient, ByteCounters), ConfigError> {
    let target = config.target()?;
    let counters = ByteCounters::new();
    let tls = if target.tls {
        Some(build_tls_context(config, &target.host)?)
    } else {
        None
    };
    let socks5 = config.socks5_addr();
    let http_proxy = if socks5.is_none() {
        proxy_from_env(target.tls, &target.host)
    } else {
        None
    };
    let dialer = Dialer {
        addr: target.addr(),
        socks5,
        http_proxy,
        dial_timeout: config.dial_timeout,
        read_timeout: config.read_timeout,
        write_timeout: config.write_timeout,
        counters: counters.clone(),
        tls,
    };
    let client = Client::builder()
        .pool_max_idle_per_host(config.concurrency as usize)
        .build::<_, Body>(dialer);
    Ok((client, counters))
}

fn build_tls_context(config: &RunConfig, host: &str) -> Result<TlsContext, ConfigError> {
    let identity = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Some(load_identity(cert, key)?),
        _ => None,
    };

    let tls_config = if config.insecure {
        let builder = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()));
        match identity {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key),
            None => Ok(builder.with_no_client_auth()),
        }
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs().map_err(|e| {
            ConfigError::TlsRead {
                path: "system trust roots".to_string(),
                message: e.to_string(),
            }
        })?;
        for cert in native {
            // Individual unparsable system roots are skipped.
            let _ = roots.add(cert);
        }
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        match identity {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key),
            None => Ok(builder.with_no_client_auth()),
        }
    }
    .map_err(|e| ConfigError::TlsRead {
        path: "client certificate".to_string(),
        message: e.to_string(),
    })?;

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| ConfigError::InvalidUrl {
            url: config.url.to_string(),
            message: format!("not a valid TLS server name: {}", e),
        })?;
    Ok(TlsContext {
        connector: TlsConnector::from(Arc::new(tls_config)),
        server_name,
    })
}

fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigError> {
    let read_err = |path: &Path, e: &dyn std::fmt::Display| ConfigError::TlsRead {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    let mut cert_reader =
        BufReader::new(File::open(cert_path).map_err(|e| read_err(cert_path, &e))?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| read_err(cert_path, &e))?;
    if certs.is_empty() {
        return Err(read_err(cert_path, &"no PEM certificates found"));
    }
    let mut key_reader = BufReader::new(File::open(key_path).map_err(|e| read_err(key_path, &e))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| read_err(key_path, &e))?
        .ok_or_else(|| read_err(key_path, &"no PEM private key found"))?;
    Ok((certs, key))
}

/// Certificate verifier behind `--insecure`: accepts any chain but still
/// checks handshake signatures with the default provider.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Immutable per-request template, built once at startup.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Assembles the header template: Host (override or URL host), optional
/// Content-Type, then every custom header in order with duplicates kept.
pub fn build_template(config: &RunConfig) -> Result<RequestTemplate, ConfigError> {
    let target = config.target()?;
    let mut headers = HeaderMap::new();

    let host_value = match &config.host_header {
        Some(h) => h.clone(),
        None => match (target.tls, target.port) {
            (false, 80) | (true, 443) => target.host.clone(),
            _ => target.addr(),
        },
    };
    headers.insert(
        HOST,
        HeaderValue::from_str(&host_value)
            .map_err(|_| ConfigError::InvalidHeader(format!("Host: {}", host_value)))?,
    );

    if let Some(ct) = &config.content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(ct)
                .map_err(|_| ConfigError::InvalidHeader(format!("Content-Type: {}", ct)))?,
        );
    }

    for (name, value) in &config.headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|_| ConfigError::InvalidHeader(format!("{}: {}", name, value)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| ConfigError::InvalidHeader(format!("{}: {}", name, value)))?;
        headers.append(header_name, header_value);
    }

    Ok(RequestTemplate {
        method: config.method.clone(),
        uri: config.url.clone(),
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BodySource, Rate};

    fn config_for(url: &str) -> RunConfig {
        RunConfig {
            url: url.parse().unwrap(),
            method: Method::GET,
            headers: Vec::new(),
            body: BodySource::None,
            cert_path: None,
            key_path: None,
            insecure: false,
            concurrency: 2,
            requests: 0,
            duration: None,
            rate: Rate::Infinity,
            request_timeout: None,
            dial_timeout: None,
            read_timeout: None,
            write_timeout: None,
            socks5: None,
            host_header: None,
            content_type: None,
        }
    }

    #[test]
    fn test_template_sets_host_from_url() {
        let t = build_template(&config_for("http://example.com/x")).unwrap();
        assert_eq!(t.headers.get(HOST).unwrap(), "example.com");
    }

    #[test]
    fn test_template_keeps_nonstandard_port_in_host() {
        let t = build_template(&config_for("http://example.com:8080/x")).unwrap();
        assert_eq!(t.headers.get(HOST).unwrap(), "example.com:8080");
    }

    #[test]
    fn test_template_host_override() {
        let mut c = config_for("http://127.0.0.1:9000/");
        c.host_header = Some("api.internal".to_string());
        let t = build_template(&c).unwrap();
        assert_eq!(t.headers.get(HOST).unwrap(), "api.internal");
    }

    #[test]
    fn test_template_preserves_duplicate_headers_in_order() {
        let mut c = config_for("http://example.com/");
        c.headers = vec![
            ("X-Tag".to_string(), "one".to_string()),
            ("X-Tag".to_string(), "two".to_string()),
        ];
        let t = build_template(&c).unwrap();
        let values: Vec<_> = t.headers.get_all("X-Tag").iter().collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn test_template_rejects_malformed_header() {
        let mut c = config_for("http://example.com/");
        c.headers = vec![("Bad\nName".to_string(), "v".to_string())];
        assert!(matches!(
            build_template(&c),
            Err(ConfigError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_no_proxy_patterns() {
        assert!(no_proxy_matches("*", "example.com"));
        assert!(no_proxy_matches("example.com", "example.com"));
        assert!(no_proxy_matches(".internal", "api.internal"));
        assert!(no_proxy_matches("internal", "api.internal"));
        assert!(no_proxy_matches("a.com, b.com", "b.com"));
        assert!(!no_proxy_matches("example.com", "other.com"));
        assert!(!no_proxy_matches("", "example.com"));
    }

    #[test]
    fn test_proxy_authority_forms() {
        assert_eq!(
            proxy_authority("http://proxy.local:3128").unwrap(),
            "proxy.local:3128"
        );
        assert_eq!(proxy_authority("http://proxy.local").unwrap(), "proxy.local:80");
        assert_eq!(proxy_authority("proxy.local:8080").unwrap(), "proxy.local:8080");
        assert!(proxy_authority("").is_none());
    }

    #[test]
    fn test_template_content_type() {
        let mut c = config_for("http://example.com/");
        c.content_type = Some("application/json".to_string());
        let t = build_template(&c).unwrap();
        assert_eq!(t.headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
