//! Listener pool and per-connection forwarding engine
//!
//! One `ProxyServer` drives one accept socket (plaintext or TLS). Each
//! accepted connection becomes a task: optional TLS handshake, HTTP/1.1
//! request loop, host → route resolution, a fresh upstream dial per request,
//! and streaming relay of the response. Upgrade requests on
//! websocket-enabled sites switch the connection into a bidirectional
//! byte-for-byte tunnel. Every wait is bounded by the configured idle
//! timeout.

use crate::error::{error_response, ProxyError};
use crate::router::{normalize_host, Route, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Headers that apply to a single transport hop and are never forwarded,
/// except that `Connection` and `Upgrade` survive on upgrade requests
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Upper bound on an upstream upgrade-response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const BRIDGE_BUF_SIZE: usize = 8 * 1024;

/// One listening socket plus the shared state its connections need
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: Arc<arc_swap::ArcSwap<RouteTable>>,
    tls_acceptor: Option<TlsAcceptor>,
    idle_timeout: Duration,
    limiter: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the accept socket
    ///
    /// The limiter is shared across listeners so `max_connections` caps the
    /// process-wide number of live connections.
    pub async fn bind(
        addr: SocketAddr,
        routes: Arc<arc_swap::ArcSwap<RouteTable>>,
        idle_timeout: Duration,
        limiter: Arc<Semaphore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            routes,
            tls_acceptor: None,
            idle_timeout,
            limiter,
            shutdown_rx,
        })
    }

    /// Terminate TLS on this listener
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Address the listener actually bound (port 0 resolves here)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.local_addr, protocol, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            // Take a permit before accepting: at capacity, pending sockets
            // wait in the kernel backlog instead of being accepted and
            // dropped.
            let permit = tokio::select! {
                permit = Arc::clone(&self.limiter).acquire_owned() => {
                    permit.expect("connection limiter closed")
                }
                _ = shutdown_flagged(&mut shutdown_rx) => break,
            };

            let (stream, addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown_flagged(&mut shutdown_rx) => break,
            };

            // The snapshot captured here serves every request on this
            // connection, even across reloads.
            let routes = self.routes.load_full();
            let tls_acceptor = self.tls_acceptor.clone();
            let idle_timeout = self.idle_timeout;
            let conn_shutdown = self.shutdown_rx.clone();

            tokio::spawn(async move {
                let _permit = permit;

                if let Some(acceptor) = tls_acceptor {
                    match timeout(idle_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => {
                            if let Err(e) =
                                serve_connection(tls_stream, addr, routes, idle_timeout, conn_shutdown)
                                    .await
                            {
                                debug!(addr = %addr, error = %e, "TLS connection error");
                            }
                        }
                        Ok(Err(e)) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
                        Err(_) => debug!(addr = %addr, "TLS handshake timed out"),
                    }
                } else if let Err(e) =
                    serve_connection(stream, addr, routes, idle_timeout, conn_shutdown).await
                {
                    debug!(addr = %addr, error = %e, "Connection error");
                }
            });
        }

        info!(addr = %self.local_addr, protocol, "Proxy server stopped accepting");
        Ok(())
    }
}

/// Resolves when shutdown has been signalled (or the sender is gone)
async fn shutdown_flagged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Drive one accepted transport through the HTTP request loop
///
/// Generic over the transport so plaintext and TLS connections share one
/// code path. Cancellation on shutdown drops the connection future, which
/// releases both transports.
async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RouteTable>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let request_shutdown = shutdown_rx.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let shutdown_rx = request_shutdown.clone();
        async move { handle_request(req, routes, addr, idle_timeout, shutdown_rx).await }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .preserve_header_case(true)
        .header_read_timeout(idle_timeout)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        result = conn => result.map_err(|e| anyhow::anyhow!("Connection error: {}", e)),
        _ = shutdown_flagged(&mut shutdown_rx) => Ok(()),
    }
}

/// The per-request path: host → route → forward or upgrade
async fn handle_request(
    req: Request<Incoming>,
    routes: Arc<RouteTable>,
    client_addr: SocketAddr,
    idle_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = match req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(normalize_host)
    {
        Some(host) => host,
        None => {
            debug!(addr = %client_addr, "Missing or invalid Host header");
            return Ok(error_response(
                ProxyError::MissingHost,
                "Missing or invalid Host header",
            ));
        }
    };

    let route = match routes.resolve(&host) {
        Some(route) => route.clone(),
        None => {
            debug!(host, "No route for host");
            return Ok(error_response(
                ProxyError::UnknownHost,
                "No site configured for this host",
            ));
        }
    };

    debug!(host, method = %req.method(), uri = %req.uri(), "Incoming request");

    if is_upgrade_request(&req) && route.websocket {
        return handle_upgrade(req, route, host, idle_timeout, shutdown_rx).await;
    }

    forward_request(req, route, host, idle_timeout).await
}

/// Dial the route's upstream endpoint, DNS included, bounded by the idle
/// timeout
async fn dial_upstream(route: &Route, idle_timeout: Duration) -> anyhow::Result<TcpStream> {
    let addr = (route.upstream_host.as_str(), route.upstream_port);
    let stream = timeout(idle_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("Connect timed out"))?
        .map_err(|e| anyhow::anyhow!("Connect failed: {}", e))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Relay a plain request: strip hop-by-hop headers, dial, stream the bodies
async fn forward_request(
    mut req: Request<Incoming>,
    route: Route,
    host: String,
    idle_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    strip_hop_by_hop(req.headers_mut());

    // Client Host passes through unless the site rewrites to the upstream
    // authority
    if route.rewrite_host {
        if let Ok(value) = HeaderValue::from_str(&route.upstream_authority()) {
            req.headers_mut().insert(hyper::header::HOST, value);
        }
    }

    let upstream = match dial_upstream(&route, idle_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host, upstream = %route.upstream_authority(), error = %e, "Upstream dial failed");
            return Ok(error_response(
                ProxyError::UpstreamUnreachable,
                "Failed to reach upstream",
            ));
        }
    };

    let (mut sender, conn) =
        match timeout(idle_timeout, hyper::client::conn::http1::handshake(TokioIo::new(upstream)))
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(host, error = %e, "Upstream connection setup failed");
                return Ok(error_response(
                    ProxyError::UpstreamFailed,
                    "Upstream connection failed",
                ));
            }
            Err(_) => {
                return Ok(error_response(
                    ProxyError::UpstreamUnreachable,
                    "Upstream timed out",
                ));
            }
        };

    // Drives the upstream socket until the response body is fully streamed
    let upstream_authority = route.upstream_authority();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(upstream = %upstream_authority, error = %e, "Upstream connection ended with error");
        }
    });

    match timeout(idle_timeout, sender.send_request(req)).await {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop(response.headers_mut());
            Ok(response.map(|body| body.boxed()))
        }
        Ok(Err(e)) => {
            warn!(host, upstream = %route.upstream_authority(), error = %e, "Upstream request failed");
            Ok(error_response(
                ProxyError::UpstreamFailed,
                "Upstream request failed",
            ))
        }
        Err(_) => {
            warn!(host, upstream = %route.upstream_authority(), "Upstream response timed out");
            Ok(error_response(
                ProxyError::UpstreamUnreachable,
                "Upstream timed out",
            ))
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();

    for name in connection_named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// True when the request asks to switch protocols
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Serialize the client's upgrade request for the upstream leg
///
/// Hop-by-hop headers are dropped except `Connection` and `Upgrade`, which
/// carry the upgrade itself.
fn build_upgrade_request<B>(req: &Request<B>, route: &Route) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    let host_value = if route.rewrite_host {
        Some(route.upstream_authority())
    } else {
        req.headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    if let Some(host) = host_value {
        out.push_str(&format!("Host: {}\r\n", host));
    }

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) && lower != "connection" && lower != "upgrade" {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    out.push_str("\r\n");
    out.into_bytes()
}

/// Read the upstream response head (through the blank line); returns the
/// head bytes and anything past it, which already belongs to the tunnel
async fn read_response_head(
    stream: &mut TcpStream,
    idle_timeout: Duration,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = timeout(idle_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out reading upgrade response"))?
            .map_err(|e| anyhow::anyhow!("Read failed: {}", e))?;
        if n == 0 {
            anyhow::bail!("Upstream closed before completing upgrade response");
        }

        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            anyhow::bail!("Upgrade response head too large");
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse an HTTP/1.1 response head into status and headers
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Relay an upgrade request and, on 101 from both legs, bridge the raw
/// byte streams until either side closes
async fn handle_upgrade(
    req: Request<Incoming>,
    route: Route,
    host: String,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let raw_request = build_upgrade_request(&req, &route);

    let mut upstream = match dial_upstream(&route, idle_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host, upstream = %route.upstream_authority(), error = %e, "Upstream dial failed for upgrade");
            return Ok(error_response(
                ProxyError::UpstreamUnreachable,
                "Failed to reach upstream",
            ));
        }
    };

    if let Err(e) = upstream.write_all(&raw_request).await {
        warn!(host, error = %e, "Failed to send upgrade request upstream");
        return Ok(error_response(
            ProxyError::UpstreamFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, leftover) = match read_response_head(&mut upstream, idle_timeout).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(host, error = %e, "Failed to read upgrade response");
            return Ok(error_response(
                ProxyError::UpstreamFailed,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    let (status, upstream_headers) = match parse_response_head(&head) {
        Some(parsed) => parsed,
        None => {
            warn!(host, "Unparseable upgrade response from upstream");
            return Ok(error_response(
                ProxyError::UpstreamFailed,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    // Upstream declined: relay its verdict and close this connection
    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host, status = %status, "Upstream refused upgrade");
        let mut builder = Response::builder()
            .status(status)
            .header(hyper::header::CONNECTION, "close");
        for (name, value) in &upstream_headers {
            let lower = name.to_ascii_lowercase();
            if lower == "connection" || lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), hv);
            }
        }
        return Ok(builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(host, "WebSocket upgrade accepted by upstream");

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &upstream_headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), hv);
        }
    }
    let response = builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        let tunnel = async {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    // Bytes the upstream sent past its response head are the
                    // first tunnel payload
                    if !leftover.is_empty() {
                        if let Err(e) = client.write_all(&leftover).await {
                            debug!(host, error = %e, "Failed to flush buffered upstream bytes");
                            return;
                        }
                    }
                    bridge(client, upstream, idle_timeout, &host).await;
                }
                Err(e) => debug!(host, error = %e, "Client upgrade failed"),
            }
        };

        tokio::select! {
            _ = tunnel => {}
            _ = shutdown_flagged(&mut shutdown_rx) => {
                debug!("Bridge cancelled by shutdown");
            }
        }
    });

    Ok(response)
}

/// Bidirectional byte relay between the upgraded client and the upstream
///
/// The reverse direction runs as its own task. Whichever direction finishes
/// first (EOF, error or idle timeout) cancels the other; dropping the halves
/// closes both transports.
async fn bridge<C, U>(client: C, upstream: U, idle_timeout: Duration, host: &str)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let mut reverse = tokio::spawn(copy_until_close(upstream_read, client_write, idle_timeout));
    let forward = copy_until_close(client_read, upstream_write, idle_timeout);

    tokio::select! {
        result = forward => {
            reverse.abort();
            match result {
                Ok(sent) => debug!(host, sent, "Tunnel closed by client"),
                Err(e) => debug!(host, error = %e, "Tunnel client leg failed"),
            }
        }
        result = &mut reverse => {
            match result {
                Ok(Ok(sent)) => debug!(host, sent, "Tunnel closed by upstream"),
                Ok(Err(e)) => debug!(host, error = %e, "Tunnel upstream leg failed"),
                Err(_) => {}
            }
        }
    }
}

/// Copy until EOF, error or idle timeout; clean EOF propagates a write
/// shutdown so the peer sees the half-close
async fn copy_until_close<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Duration,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BRIDGE_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            // Inactivity bound reached; the caller tears the tunnel down
            Err(_) => return Ok(total),
        };

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
