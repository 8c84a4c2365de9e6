//! Phase-timed HTTP(S) probes.
//!
//! A probe is executed over a single, freshly opened connection so every
//! lifecycle phase can be observed directly:
//!
//! ```text
//! start ─ dns ─ tcp ─ [tls] ─ first byte ─ end
//!        │     │     │       │            └ content transfer
//!        │     │     │       └ time to first byte (from tls, else tcp)
//!        │     │     └ tls handshake (https only)
//!        │     └ tcp connection
//!        └ dns lookup
//! ```
//!
//! Phases that never happened (no TLS on `http`, or a failure before the
//! phase was reached) are reported as absent rather than zero. Execution never
//! fails its caller: failures are folded into [`ResponseRecord::error`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::HttpBody;
use hyper::header::{HeaderMap, HOST};
use hyper::{Body, Method, Request, Uri, Version};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::errors::{ErrorCategory, ProbeError};
use crate::metrics::{PROBES_TOTAL, PROBE_DURATION_SECONDS};

/// One outbound probe, as carried in command payloads.
///
/// The target is either a full `url` or the `protocol`/`hostname`/`port`/`path`
/// components; `url` wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    /// Correlation id echoed into the response record.
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub include_body: bool,
    /// Bound on the whole exchange, in milliseconds. Unbounded when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim_end_matches(':').to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A request target resolved from a [`RequestConfig`].
#[derive(Debug, Clone, PartialEq)]
struct Target {
    scheme: Scheme,
    /// Host as written in the authority (IPv6 literals keep their brackets).
    authority_host: String,
    port: u16,
    path_and_query: String,
}

impl Target {
    /// Host suitable for resolution and TLS server names.
    fn connect_host(&self) -> &str {
        self.authority_host
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.authority_host.clone()
        } else {
            format!("{}:{}", self.authority_host, self.port)
        }
    }
}

impl RequestConfig {
    fn target(&self) -> Result<Target, ProbeError> {
        match &self.url {
            Some(url) => target_from_url(url),
            None => self.target_from_parts(),
        }
    }

    fn target_from_parts(&self) -> Result<Target, ProbeError> {
        let scheme_str = self.protocol.as_deref().unwrap_or("http");
        let scheme = Scheme::parse(scheme_str).ok_or_else(|| {
            ProbeError::new(
                ErrorCategory::InvalidRequest,
                format!("unsupported protocol '{}'", scheme_str),
            )
        })?;
        let host = self
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProbeError::new(ErrorCategory::InvalidRequest, "missing hostname"))?;
        let authority_host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let path = match self.path.as_deref() {
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{}", p),
            None => "/".to_string(),
        };
        Ok(Target {
            scheme,
            authority_host,
            port: self.port.unwrap_or_else(|| scheme.default_port()),
            path_and_query: path,
        })
    }
}

fn target_from_url(url: &str) -> Result<Target, ProbeError> {
    let invalid = |msg: String| ProbeError::new(ErrorCategory::InvalidRequest, msg);
    let uri: Uri = url
        .parse()
        .map_err(|e| invalid(format!("invalid url '{}': {}", url, e)))?;
    let scheme = uri
        .scheme_str()
        .and_then(Scheme::parse)
        .ok_or_else(|| invalid(format!("url '{}' must use http or https", url)))?;
    let authority_host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid(format!("url '{}' has no host", url)))?
        .to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .to_string();
    Ok(Target {
        scheme,
        authority_host,
        port: uri.port_u16().unwrap_or_else(|| scheme.default_port()),
        path_and_query,
    })
}

/// Monotonic phase boundaries of one probe.
#[derive(Debug, Clone, Copy)]
pub struct TimingRecord {
    pub start: Instant,
    pub dns: Option<Instant>,
    pub tcp: Option<Instant>,
    pub tls: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub end: Option<Instant>,
}

fn ms_between(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

impl TimingRecord {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            dns: None,
            tcp: None,
            tls: None,
            first_byte: None,
            end: None,
        }
    }

    pub fn finish(&mut self) {
        self.end = Some(Instant::now());
    }

    fn end_or_now(&self) -> Instant {
        self.end.unwrap_or_else(Instant::now)
    }

    /// Per-phase durations. Each phase runs from the previous completed
    /// boundary to its own; first byte is measured from TLS when present.
    pub fn phases(&self) -> TimingPhases {
        let end = self.end_or_now();
        let span = |from: Option<Instant>, to: Option<Instant>| match (from, to) {
            (Some(from), Some(to)) => Some(ms_between(from, to)),
            _ => None,
        };
        TimingPhases {
            dns_lookup: span(Some(self.start), self.dns),
            tcp_connection: span(self.dns, self.tcp),
            tls_handshake: span(self.tcp, self.tls),
            first_byte: span(self.tls.or(self.tcp), self.first_byte),
            content_transfer: span(self.first_byte, Some(end)),
            total: ms_between(self.start, end),
        }
    }

    /// Boundaries as offsets from `start`.
    pub fn offsets(&self) -> Timings {
        let at = |instant: Option<Instant>| instant.map(|i| ms_between(self.start, i));
        Timings {
            lookup: at(self.dns),
            connect: at(self.tcp),
            secure_connect: at(self.tls),
            response: at(self.first_byte),
            end: ms_between(self.start, self.end_or_now()),
        }
    }
}

/// Phase durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingPhases {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_lookup: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_connection: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_handshake: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_transfer: Option<f64>,
    pub total: f64,
}

impl TimingPhases {
    /// Sum of every phase that was measured.
    pub fn sum_of_phases(&self) -> f64 {
        [
            self.dns_lookup,
            self.tcp_connection,
            self.tls_handshake,
            self.first_byte,
            self.content_transfer,
        ]
        .iter()
        .flatten()
        .sum()
    }
}

/// Phase boundaries in milliseconds since the probe started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_connect: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<f64>,
    pub end: f64,
}

/// Everything observed about one probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub trailers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    pub timing_phases: TimingPhases,
    pub timings: Timings,
}

/// Executes probes. Cheap to clone; the TLS configuration is shared.
#[derive(Clone)]
pub struct RequestTimer {
    tls: Arc<ClientConfig>,
}

impl RequestTimer {
    /// Build a timer trusting the platform's native root certificates.
    ///
    /// An unreadable or empty native store is logged and leaves https probes
    /// failing with `tls_error`; plain http probes are unaffected.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!(added, ignored, "Loaded native root certificates");
            }
            Err(e) => {
                warn!(error = %e, "Failed to load native root certificates");
            }
        }
        if roots.is_empty() {
            warn!("No trusted root certificates; https probes will fail");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self::with_tls_config(Arc::new(config))
    }

    /// Build a timer with a caller-supplied TLS configuration.
    pub fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }

    /// Execute one probe. Never fails; see [`ResponseRecord::error`].
    pub async fn execute(&self, config: &RequestConfig) -> ResponseRecord {
        let mut timing = TimingRecord::start();
        let mut record = ResponseRecord {
            id: config.id.clone(),
            ..Default::default()
        };

        let exchange = self.exchange(config, &mut timing, &mut record);
        let outcome = match config.timeout {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(ProbeError::new(
                        ErrorCategory::TimeoutError,
                        format!("probe timed out after {} ms", ms),
                    ))
                }),
            None => exchange.await,
        };
        timing.finish();

        let outcome_label = match outcome {
            Ok(()) => "ok",
            Err(e) => {
                debug!(id = %config.id, error = %e, "Probe failed");
                record.error = Some(e.message);
                record.error_category = Some(e.category.label().to_string());
                e.category.label()
            }
        };

        record.timing_phases = timing.phases();
        record.timings = timing.offsets();

        PROBES_TOTAL.with_label_values(&[outcome_label]).inc();
        PROBE_DURATION_SECONDS.observe(record.timing_phases.total / 1000.0);

        debug!(
            id = %config.id,
            status_code = ?record.status_code,
            total_ms = record.timing_phases.total,
            "Probe completed"
        );
        record
    }

    async fn exchange(
        &self,
        config: &RequestConfig,
        timing: &mut TimingRecord,
        record: &mut ResponseRecord,
    ) -> Result<(), ProbeError> {
        let target = config.target()?;
        let request = build_request(config, &target)?;

        let addr = resolve(&target).await?;
        timing.dns = Some(Instant::now());

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            ProbeError::new(
                ErrorCategory::from_connect_error(&e),
                format!("connect {}: {}", addr, e),
            )
        })?;
        timing.tcp = Some(Instant::now());

        if let Ok(local) = stream.local_addr() {
            record.local_address = Some(local.ip().to_string());
            record.local_port = Some(local.port());
        }

        match target.scheme {
            Scheme::Http => send_over(stream, request, config.include_body, timing, record).await,
            Scheme::Https => {
                let server_name = ServerName::try_from(target.connect_host())
                    .map_err(|e| {
                        ProbeError::new(
                            ErrorCategory::TlsError,
                            format!("invalid TLS server name '{}': {}", target.connect_host(), e),
                        )
                    })?
                    .to_owned();
                let tls_stream = TlsConnector::from(Arc::clone(&self.tls))
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ProbeError::new(ErrorCategory::TlsError, e.to_string()))?;
                timing.tls = Some(Instant::now());
                send_over(tls_stream, request, config.include_body, timing, record).await
            }
        }
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve(target: &Target) -> Result<SocketAddr, ProbeError> {
    let host = target.connect_host();
    let mut addrs = tokio::net::lookup_host((host, target.port))
        .await
        .map_err(|e| ProbeError::new(ErrorCategory::DnsError, format!("resolve {}: {}", host, e)))?;
    addrs.next().ok_or_else(|| {
        ProbeError::new(
            ErrorCategory::DnsError,
            format!("resolve {}: no addresses", host),
        )
    })
}

/// Build the request exactly as the caller described it. Only `Host` is
/// added (when absent); a missing body stays empty so no content headers are
/// generated for it.
fn build_request(config: &RequestConfig, target: &Target) -> Result<Request<Body>, ProbeError> {
    let invalid = |msg: String| ProbeError::new(ErrorCategory::InvalidRequest, msg);

    let method_str = config.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|e| invalid(format!("invalid method '{}': {}", method_str, e)))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(target.path_and_query.as_str())
        .version(Version::HTTP_11);

    if !config.headers.keys().any(|k| k.eq_ignore_ascii_case("host")) {
        builder = builder.header(HOST, target.host_header());
    }
    for (name, value) in &config.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body = match &config.body {
        Some(body) => Body::from(body.clone()),
        None => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|e| invalid(format!("invalid request: {}", e)))
}

fn hyper_error(error: &hyper::Error) -> ProbeError {
    ProbeError::new(ErrorCategory::from_hyper_error(error), error.to_string())
}

async fn send_over<T>(
    io: T,
    request: Request<Body>,
    include_body: bool,
    timing: &mut TimingRecord,
    record: &mut ResponseRecord,
) -> Result<(), ProbeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::handshake(io)
        .await
        .map_err(|e| hyper_error(&e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Probe connection closed with error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| hyper_error(&e))?;
    timing.first_byte = Some(Instant::now());

    let (parts, mut body) = response.into_parts();
    record.http_version = Some(version_label(parts.version).to_string());
    record.status_code = Some(parts.status.as_u16());
    record.status_message = parts.status.canonical_reason().map(str::to_string);
    record.headers = flatten_headers(&parts.headers);

    // Drain the body even when it is not wanted: the transfer phase ends when
    // the last byte arrives, and an unread body would pin the connection.
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ProbeError::new(ErrorCategory::BodyError, e.to_string()))?;
        if include_body {
            collected.extend_from_slice(&chunk);
        }
    }
    if let Some(trailers) = body
        .trailers()
        .await
        .map_err(|e| ProbeError::new(ErrorCategory::BodyError, e.to_string()))?
    {
        record.trailers = flatten_headers(&trailers);
    }
    if include_body {
        record.body = Some(String::from_utf8_lossy(&collected).into_owned());
    }
    Ok(())
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}

/// Header map as name → value, repeated names joined with ", ".
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}
