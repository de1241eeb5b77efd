//! Reverse proxy controller
//! Routes requests by Host header to the upstream of a published domain

use crate::entries::{DomainEntry, Protocol};
use crate::error::{Error, Result};
use crate::events::ChangeEvent;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use url::Url;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Pause after a failed accept so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Hop-by-hop headers are never forwarded
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub https_port: u16,
    pub enable_https: bool,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Extra trust anchor for https upstreams (the local root CA)
    pub upstream_root_pem: Option<String>,
    /// Largest request body buffered for forwarding
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            https_port: 443,
            enable_https: false,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            upstream_root_pem: None,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A routing rule for one published domain
#[derive(Clone)]
pub struct ProxyRoute {
    pub domain: String,
    pub upstream: Url,
    pub tls_required: bool,
    tls: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for ProxyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRoute")
            .field("domain", &self.domain)
            .field("upstream", &self.upstream.as_str())
            .field("tls_required", &self.tls_required)
            .finish()
    }
}

/// Immutable routing snapshot. Rebuilt from scratch and swapped whole.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, ProxyRoute>,
    tls_config: Option<Arc<ServerConfig>>,
}

impl RoutingTable {
    /// One route per published entry. TLS is bound only when the entry is
    /// served over https and `tls` yields signing material for it; otherwise
    /// the route is plain http.
    pub fn build<F>(entries: &[DomainEntry], tls: F) -> Self
    where
        F: Fn(&str) -> Option<Arc<CertifiedKey>>,
    {
        let mut routes = HashMap::new();

        for entry in entries.iter().filter(|e| e.published) {
            let upstream = match Url::parse(&entry.local_target) {
                Ok(url) if url.host_str().is_some() => url,
                _ => {
                    warn!("Skipping route for {}: bad target {}", entry.domain, entry.local_target);
                    continue;
                }
            };

            let material = match entry.protocol {
                Protocol::Https => {
                    let material = tls(&entry.domain);
                    if material.is_none() {
                        warn!("No TLS material for {}, serving plain http", entry.domain);
                    }
                    material
                }
                Protocol::Http => None,
            };

            routes.insert(
                entry.domain.clone(),
                ProxyRoute {
                    domain: entry.domain.clone(),
                    upstream,
                    tls_required: material.is_some(),
                    tls: material,
                },
            );
        }

        let keys: HashMap<String, Arc<CertifiedKey>> = routes
            .values()
            .filter_map(|r| r.tls.clone().map(|k| (r.domain.clone(), k)))
            .collect();

        let tls_config = if keys.is_empty() {
            None
        } else {
            let mut config = ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(TableResolver { keys }));
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Some(Arc::new(config))
        };

        Self { routes, tls_config }
    }

    pub fn route(&self, host: &str) -> Option<&ProxyRoute> {
        self.routes.get(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes sorted by domain
    pub fn routes(&self) -> Vec<&ProxyRoute> {
        let mut routes: Vec<&ProxyRoute> = self.routes.values().collect();
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));
        routes
    }
}

/// SNI resolver over the TLS routes of a single table
struct TableResolver {
    keys: HashMap<String, Arc<CertifiedKey>>,
}

impl fmt::Debug for TableResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableResolver")
            .field("domains", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for TableResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.keys.get(sni).cloned()
    }
}

/// Produces the routing table from current registry and certificate state
pub trait RouteSource: Send + Sync {
    fn routing_table(&self) -> RoutingTable;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub is_running: bool,
    pub port: Option<u16>,
    pub https_port: Option<u16>,
}

struct RunningListeners {
    port: u16,
    https_port: Option<u16>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

pub struct ProxyController {
    config: ProxyConfig,
    source: Arc<dyn RouteSource>,
    table: RwLock<Arc<RoutingTable>>,
    /// Held across build and swap so rebuilds land in order
    rebuild: Mutex<()>,
    upstream_tls: TlsConnector,
    listeners: AsyncMutex<Option<RunningListeners>>,
}

impl ProxyController {
    pub fn new(config: ProxyConfig, source: Arc<dyn RouteSource>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(pem) = &config.upstream_root_pem {
            let mut reader = pem.as_bytes();
            for cert in rustls_pemfile::certs(&mut reader).flatten() {
                if let Err(e) = roots.add(cert) {
                    warn!("Ignoring local root CA for upstream TLS: {}", e);
                }
            }
        }

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            config,
            source,
            table: RwLock::new(Arc::new(RoutingTable::default())),
            rebuild: Mutex::new(()),
            upstream_tls: TlsConnector::from(Arc::new(client)),
            listeners: AsyncMutex::new(None),
        }
    }

    /// Snapshot of the active routing table
    pub fn routes(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Rebuild the routing table and swap it in. Rebuilds are serialized, so
    /// the last one to finish always reflects the latest state.
    pub fn sync_routes(&self) -> usize {
        let _rebuild = self.rebuild.lock();
        let table = Arc::new(self.source.routing_table());
        let count = table.len();
        *self.table.write() = table;
        debug!("Routing table rebuilt with {} routes", count);
        count
    }

    /// Rebuild on every change event until the bus closes
    pub fn spawn_route_sync(self: &Arc<Self>, mut rx: broadcast::Receiver<ChangeEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!("Change event: {:?}", event);
                        this.sync_routes();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Route sync lagged by {} events", skipped);
                        this.sync_routes();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn status(&self) -> ProxyStatus {
        Self::status_of(self.listeners.lock().await.as_ref())
    }

    fn status_of(running: Option<&RunningListeners>) -> ProxyStatus {
        match running {
            Some(r) => ProxyStatus {
                is_running: true,
                port: Some(r.port),
                https_port: r.https_port,
            },
            None => ProxyStatus {
                is_running: false,
                port: None,
                https_port: None,
            },
        }
    }

    /// Bind the listener(s). A no-op returning the current status when
    /// already running; on failure nothing is left bound.
    pub async fn start(self: &Arc<Self>, port: u16) -> Result<ProxyStatus> {
        let mut listeners = self.listeners.lock().await;
        if let Some(running) = listeners.as_ref() {
            return Ok(Self::status_of(Some(running)));
        }

        let http = Self::bind(port).await?;
        let https = if self.config.enable_https {
            Some(Self::bind(self.config.https_port).await?)
        } else {
            None
        };

        let port = http.local_addr()?.port();
        let https_port = match &https {
            Some(l) => Some(l.local_addr()?.port()),
            None => None,
        };

        self.sync_routes();

        let mut tasks = vec![tokio::spawn(Arc::clone(self).serve(http, Scheme::Http))];
        if let Some(listener) = https {
            tasks.push(tokio::spawn(Arc::clone(self).serve(listener, Scheme::Https)));
        }

        info!("Proxy listening on HTTP:{}", port);
        if let Some(p) = https_port {
            info!("Proxy listening on HTTPS:{}", p);
        }

        let running = RunningListeners {
            port,
            https_port,
            tasks,
        };
        let status = Self::status_of(Some(&running));
        *listeners = Some(running);
        Ok(status)
    }

    async fn bind(port: u16) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        TcpListener::bind(addr).await.map_err(|e| Error::Bind {
            port,
            reason: e.to_string(),
        })
    }

    /// Close the listeners; connections already accepted run to completion
    pub async fn stop(&self) -> Result<()> {
        if let Some(running) = self.listeners.lock().await.take() {
            for task in running.tasks {
                task.abort();
            }
            info!("Proxy stopped (was on port {})", running.port);
        }
        Ok(())
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, scheme: Scheme) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let table = self.routes();
            let this = Arc::clone(&self);

            tokio::spawn(async move {
                let result = match scheme {
                    Scheme::Http => this.handle_connection(stream, remote_addr, table, scheme).await,
                    Scheme::Https => match table.tls_config.clone() {
                        Some(config) => match TlsAcceptor::from(config).accept(stream).await {
                            Ok(tls) => this.handle_connection(tls, remote_addr, table, scheme).await,
                            Err(e) => Err(anyhow!("TLS handshake failed: {e}")),
                        },
                        None => Err(anyhow!("no TLS routes")),
                    },
                };
                if let Err(e) = result {
                    debug!("{} connection error from {}: {}", scheme.as_str(), remote_addr, e);
                }
            });
        }
    }

    /// Serve one connection against the table captured at accept time
    async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        table: Arc<RoutingTable>,
        scheme: Scheme,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let this = Arc::clone(&self);
                    let table = Arc::clone(&table);
                    async move { this.handle_request(req, remote_addr, &table, scheme).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        table: &RoutingTable,
        scheme: Scheme,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let host = match request_host(req.headers()) {
            Some(h) => h,
            None => return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Host header".to_string())),
        };

        debug!("{} {} {} from {}", scheme.as_str(), req.method(), host, remote_addr);

        let route = match table.route(&host) {
            Some(r) => r,
            None => return Ok(text_response(StatusCode::NOT_FOUND, format!("No such domain: {host}"))),
        };

        match self.forward(req, route, &host, remote_addr, scheme).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error for {}: {:#}", host, e);
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string()))
            }
        }
    }

    /// Forward a request to the route's upstream within the configured timeouts
    async fn forward(
        &self,
        req: Request<Incoming>,
        route: &ProxyRoute,
        original_host: &str,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> anyhow::Result<Response<ProxyBody>> {
        let upstream = &route.upstream;
        let host = upstream.host_str().context("upstream has no host")?.to_string();
        let port = upstream.port_or_known_default().context("upstream has no port")?;
        let authority = match upstream.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.clone(),
        };

        let (parts, body) = req.into_parts();
        let body_bytes = match Limited::new(body, self.config.max_body_bytes).collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!("Request body for {} exceeds {} bytes", original_host, self.config.max_body_bytes);
                return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large".to_string()));
            }
            Err(e) => {
                error!("Failed to read request body: {}", e);
                return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request".to_string()));
            }
        };

        let uri: Uri = upstream_path(upstream, parts.uri.path(), parts.uri.query())
            .parse()
            .context("Invalid upstream URI")?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            if !is_hop_header(key) {
                builder = builder.header(key, value);
            }
        }

        builder = builder
            .header("X-Forwarded-For", remote_addr.ip().to_string())
            .header("X-Forwarded-Host", original_host)
            .header("X-Forwarded-Proto", scheme.as_str());

        let proxy_req = builder
            .body(Full::new(body_bytes))
            .context("Failed to build proxy request")?;

        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect((host.as_str(), port)));
        let stream = match connect.await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                error!("Failed to connect to upstream {}: {}", authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway".to_string()));
            }
            Err(_) => {
                warn!("Connect to upstream {} timed out", authority);
                return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout".to_string()));
            }
        };

        let exchange = async {
            if upstream.scheme() == "https" {
                let server_name = ServerName::try_from(host.clone()).context("Invalid upstream server name")?;
                let tls = self
                    .upstream_tls
                    .connect(server_name, stream)
                    .await
                    .context("Upstream TLS handshake failed")?;
                send_upstream(tls, proxy_req).await
            } else {
                send_upstream(stream, proxy_req).await
            }
        };

        let (parts, body_bytes) = match tokio::time::timeout(self.config.response_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("Upstream {} failed: {:#}", authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway".to_string()));
            }
            Err(_) => {
                warn!("Upstream {} did not answer in time", authority);
                return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout".to_string()));
            }
        };

        let mut builder = Response::builder().status(parts.status);
        for (key, value) in parts.headers.iter() {
            if !is_hop_header(key) {
                builder = builder.header(key, value);
            }
        }

        builder
            .body(full_body(body_bytes))
            .context("Failed to build response")
    }
}

/// Send one request over a fresh upstream connection and collect the answer
async fn send_upstream<S>(
    stream: S,
    req: Request<Full<Bytes>>,
) -> anyhow::Result<(hyper::http::response::Parts, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("Failed to establish connection to upstream")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    let response = sender
        .send_request(req)
        .await
        .context("Failed to send request to upstream")?;
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .context("Failed to read upstream response body")?
        .to_bytes();

    Ok((parts, bytes))
}

/// Routing key from the Host header: lower-case, without port or trailing dot
fn request_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(HOST)?.to_str().ok()?;
    let host = raw.split(':').next().unwrap_or(raw).trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Path on the upstream: the target's base path followed by the request path
fn upstream_path(upstream: &Url, path: &str, query: Option<&str>) -> String {
    let base = upstream.path().trim_end_matches('/');
    let mut result = format!("{base}{path}");

    if !result.starts_with('/') {
        result.insert(0, '/');
    }
    if let Some(q) = query {
        result.push('?');
        result.push_str(q);
    }

    result
}

fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
