//! The external-facing router
//!
//! One listener multiplexes every configured route. Requests are matched by
//! longest path prefix, checked against the route's session limit and
//! backend state, then forwarded with the prefix stripped. WebSocket
//! upgrades are relayed byte-for-byte after a raw HTTP/1.1 handshake with
//! the backend, so the terminal protocol passes through untouched.

use crate::config::Route;
use crate::error::{json_error_response, ProxyErrorKind};
use crate::pool::{BackendClient, PoolConfig};
use crate::process::{ProcessManager, ProcessState};
use crate::sessions::{SessionGuard, SessionMultiplexer};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Status endpoint served by the router itself
const STATUS_PATH: &str = "/__termgate/status";
/// Empty sourcemap served for any *.map request so browser devtools stay
/// quiet instead of hammering backends for maps they do not serve
const SOURCEMAP_STUB: &str = r#"{"version":3,"sources":[],"names":[],"mappings":""}"#;

/// The multiplexing router server
pub struct RouterServer {
    bind_addr: SocketAddr,
    manager: Arc<ProcessManager>,
    sessions: Arc<SessionMultiplexer>,
    client: Arc<BackendClient>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RouterServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<ProcessManager>,
        sessions: Arc<SessionMultiplexer>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, manager, sessions, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        manager: Arc<ProcessManager>,
        sessions: Arc<SessionMultiplexer>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            sessions,
            client: Arc::new(BackendClient::new(pool_config)),
            shutdown_rx,
        }
    }

    pub fn client(&self) -> &Arc<BackendClient> {
        &self.client
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Router listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let sessions = Arc::clone(&self.sessions);
                            let client = Arc::clone(&self.client);

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, addr, manager, sessions, client).await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<ProcessManager>,
    sessions: Arc<SessionMultiplexer>,
    client: Arc<BackendClient>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let manager = Arc::clone(&manager);
        let sessions = Arc::clone(&sessions);
        let client = Arc::clone(&client);
        async move { handle_request(req, manager, sessions, client, addr).await }
    });

    // auto::Builder keeps HTTP/2 available for plain requests while
    // HTTP/1.1 connections can still carry WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    manager: Arc<ProcessManager>,
    sessions: Arc<SessionMultiplexer>,
    client: Arc<BackendClient>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate the request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let path = req.uri().path().to_string();
    debug!(client = %client_addr, method = %req.method(), path, request_id, "Incoming request");

    if path == STATUS_PATH {
        return Ok(status_response(&manager, &sessions));
    }

    let route = match match_route(manager.routes(), &path) {
        Some(route) => route.clone(),
        None => {
            return Ok(json_error_response(
                ProxyErrorKind::RouteNotFound,
                None,
                format!("no route matches {}", path),
            ));
        }
    };

    // Browser devtools request sourcemaps the terminal backends never ship
    if path.ends_with(".map") {
        return Ok(sourcemap_stub_response());
    }

    if let Some(response) = ensure_backend_available(&route, &manager).await {
        return Ok(response);
    }

    let port = match manager.port(&route.path) {
        Some(port) => port,
        None => {
            return Ok(json_error_response(
                ProxyErrorKind::UpstreamConnect,
                Some(&route.path),
                "backend has no allocated port",
            ));
        }
    };

    if is_upgrade_request(&req) {
        if route.check_origin(manager.defaults()) && !origin_allowed(&req) {
            warn!(route = %route.path, request_id, "Cross-origin WebSocket rejected");
            return Ok(json_error_response(
                ProxyErrorKind::OriginForbidden,
                Some(&route.path),
                "Origin header does not match Host",
            ));
        }

        let guard = match sessions.try_acquire(&route.path) {
            Some(guard) => guard,
            None => {
                return Ok(json_error_response(
                    ProxyErrorKind::SessionLimit,
                    Some(&route.path),
                    "route is at its concurrent session limit",
                ));
            }
        };

        let backend_path = backend_path_and_query(&route.path, &req);
        return handle_upgrade(req, route.path.clone(), port, backend_path, guard, request_id)
            .await;
    }

    let _guard = match sessions.try_acquire(&route.path) {
        Some(guard) => guard,
        None => {
            return Ok(json_error_response(
                ProxyErrorKind::SessionLimit,
                Some(&route.path),
                "route is at its concurrent session limit",
            ));
        }
    };

    let backend_path = backend_path_and_query(&route.path, &req);
    let request_timeout = route.request_timeout(manager.defaults());

    let result =
        tokio::time::timeout(request_timeout, client.forward(req, port, &backend_path)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(route = %route.path, port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorKind::UpstreamConnect,
                Some(&route.path),
                "failed to reach backend",
            ))
        }
        Err(_) => {
            warn!(
                route = %route.path,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorKind::UpstreamConnect,
                Some(&route.path),
                format!("backend did not respond within {}s", request_timeout.as_secs()),
            ))
        }
    }
}

/// Pick the route whose prefix is the longest match for the request path.
///
/// `/cli` matches `/cli` and `/cli/anything` but not `/client`; a root
/// route matches everything not claimed by a longer prefix.
fn match_route<'a>(routes: &'a [Route], path: &str) -> Option<&'a Route> {
    routes
        .iter()
        .filter(|route| prefix_matches(&route.path, path))
        .max_by_key(|route| route.path.len())
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

/// The path (plus query) seen by the backend: the route prefix stripped,
/// never empty
fn backend_path_and_query<B>(route_path: &str, req: &Request<B>) -> String {
    let path = req.uri().path();
    let stripped = if route_path == "/" {
        path
    } else {
        match path.strip_prefix(route_path) {
            Some("") | None => "/",
            Some(rest) => rest,
        }
    };
    match req.uri().query() {
        Some(query) => format!("{}?{}", stripped, query),
        None => stripped.to_string(),
    }
}

/// Resolve the backend to Running, spawning and waiting when allowed.
///
/// Returns the error response to send when the backend cannot serve.
async fn ensure_backend_available(
    route: &Route,
    manager: &Arc<ProcessManager>,
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    match manager.state(&route.path) {
        ProcessState::Running => None,
        ProcessState::Pending => {
            // First request on a lazy route (or a startup race); spawn now
            if let Err(e) = manager.spawn(&route.path).await {
                error!(route = %route.path, error = %e, "On-demand spawn failed");
                return Some(json_error_response(
                    ProxyErrorKind::Crashed,
                    Some(&route.path),
                    "backend failed to start",
                ));
            }
            wait_until_running(route, manager).await
        }
        ProcessState::Starting => wait_until_running(route, manager).await,
        ProcessState::Crashed => Some(json_error_response(
            ProxyErrorKind::Crashed,
            Some(&route.path),
            "backend crashed, restart pending",
        )),
        ProcessState::Failed => Some(json_error_response(
            ProxyErrorKind::TerminalUnavailable,
            Some(&route.path),
            "backend exhausted its restart budget",
        )),
        ProcessState::Stopped => Some(json_error_response(
            ProxyErrorKind::Stopped,
            Some(&route.path),
            "backend was stopped",
        )),
    }
}

/// Block until the route's backend reports Running, bounded by the startup
/// timeout
async fn wait_until_running(
    route: &Route,
    manager: &Arc<ProcessManager>,
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let timeout = route.startup_timeout(manager.defaults());

    let mut ready_rx = match manager.subscribe_ready(&route.path) {
        Some(rx) => rx,
        None => {
            return Some(json_error_response(
                ProxyErrorKind::RouteNotFound,
                Some(&route.path),
                "unknown route",
            ));
        }
    };

    let result = tokio::time::timeout(timeout, async {
        loop {
            if manager.is_running(&route.path) {
                return true;
            }
            match ready_rx.recv().await {
                Ok(()) => return true,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if manager.is_running(&route.path) {
                        return true;
                    }
                }
            }
        }
    })
    .await;

    match result {
        Ok(true) => None,
        Ok(false) | Err(_) => {
            // Report the state we actually ended in
            let kind = match manager.state(&route.path) {
                ProcessState::Failed => ProxyErrorKind::TerminalUnavailable,
                ProcessState::Crashed => ProxyErrorKind::Crashed,
                ProcessState::Stopped => ProxyErrorKind::Stopped,
                _ => ProxyErrorKind::Starting,
            };
            Some(json_error_response(
                kind,
                Some(&route.path),
                "backend is not ready",
            ))
        }
    }
}

/// Registry snapshot as JSON for operators
fn status_response(
    manager: &Arc<ProcessManager>,
    sessions: &Arc<SessionMultiplexer>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let statuses = manager.statuses(|route| sessions.active(route));
    let body = serde_json::to_string(&statuses).unwrap_or_else(|_| "[]".to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn sourcemap_stub_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from_static(SOURCEMAP_STUB.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check if a request is a WebSocket (or other protocol) upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Same-origin check: the Origin header's host must equal the Host header's
/// host. Requests without an Origin header (curl, native clients) pass.
fn origin_allowed<B>(req: &Request<B>) -> bool {
    let origin = match req
        .headers()
        .get(hyper::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
    {
        Some(origin) => origin,
        None => return true,
    };

    let origin_host = match origin
        .split_once("://")
        .map(|(_, rest)| rest.split(['/', ':']).next().unwrap_or(rest))
    {
        Some(host) if !host.is_empty() => host,
        _ => return false,
    };

    let request_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.split(':').next());

    match request_host {
        Some(host) => host.eq_ignore_ascii_case(origin_host),
        None => false,
    }
}

/// Build the raw HTTP/1.1 handshake forwarded to the backend, with the
/// request line rewritten to the prefix-stripped path
fn build_upgrade_request<B>(req: &Request<B>, port: u16, backend_path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), backend_path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");
    request.into_bytes()
}

/// Parse the backend's handshake response up to the header terminator
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

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

/// Cap on buffered handshake-response bytes before giving up
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Read the backend's handshake response until the header terminator.
///
/// Returns the buffered bytes and the offset just past `\r\n\r\n`; anything
/// beyond that offset is relay data the backend pushed eagerly. `None` means
/// the backend closed (or blew past the cap) before finishing the head.
async fn read_handshake_response(
    stream: &mut TcpStream,
) -> std::io::Result<Option<(Vec<u8>, usize)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = header_end(&buf) {
            return Ok(Some((buf, end)));
        }
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Ok(None);
        }
    }
}

/// Offset just past the `\r\n\r\n` header terminator, if present
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Relay a protocol upgrade: handshake with the backend over a fresh TCP
/// connection, mirror its 101 to the client, then copy bytes both ways
/// until either side closes. The session guard lives as long as the relay.
async fn handle_upgrade(
    req: Request<Incoming>,
    route_path: String,
    port: u16,
    backend_path: String,
    guard: SessionGuard,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let raw_request = build_upgrade_request(&req, port, &backend_path);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(route = %route_path, port, error = %e, "Backend connect failed for upgrade");
            return Ok(json_error_response(
                ProxyErrorKind::UpstreamConnect,
                Some(&route_path),
                format!("failed to connect to backend: {}", e),
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(route = %route_path, error = %e, "Failed to send handshake to backend");
        return Ok(json_error_response(
            ProxyErrorKind::UpstreamConnect,
            Some(&route_path),
            format!("failed to send handshake: {}", e),
        ));
    }

    let (handshake, head_end) = match read_handshake_response(&mut backend_stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            error!(route = %route_path, "Backend closed before completing the handshake");
            return Ok(json_error_response(
                ProxyErrorKind::UpgradeFailed,
                Some(&route_path),
                "backend closed connection",
            ));
        }
        Err(e) => {
            error!(route = %route_path, error = %e, "Failed to read handshake response");
            return Ok(json_error_response(
                ProxyErrorKind::UpgradeFailed,
                Some(&route_path),
                format!("failed to read backend response: {}", e),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&handshake[..head_end]) {
        Some(parsed) => parsed,
        None => {
            error!(route = %route_path, "Unparseable handshake response from backend");
            return Ok(json_error_response(
                ProxyErrorKind::UpgradeFailed,
                Some(&route_path),
                "invalid handshake response from backend",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(route = %route_path, status = %status, "Backend declined the upgrade");
        // Relay the backend's refusal as-is
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(route = %route_path, request_id, "Upgrade accepted, relaying");

    // Anything the backend sent in the same segment as its 101 is relay
    // payload and must not be dropped with the handshake buffer
    let early_bytes = handshake[head_end..].to_vec();

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Hop-by-hop framing headers are hyper's business
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        // Guard moves in here: the session ends when the relay ends
        let _guard = guard;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay_bidirectional(upgraded, backend_stream, &early_bytes, &route_path, &request_id)
                    .await;
            }
            Err(e) => {
                error!(route = %route_path, error = %e, "Client upgrade failed");
            }
        }
        debug!(route = %route_path, request_id, "Relay closed");
    });

    Ok(response)
}

/// Opaque byte relay between the upgraded client and the backend socket.
/// `early` holds backend bytes that arrived behind the 101 head; they go
/// out to the client before the copy loop starts.
async fn relay_bidirectional(
    client: Upgraded,
    backend: TcpStream,
    early: &[u8],
    route: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(early).await {
            debug!(route, request_id, error = %e, "Client closed before relay start");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                route,
                request_id,
                client_to_backend,
                backend_to_client,
                "Relay finished"
            );
        }
        Err(e) => {
            debug!(route, request_id, error = %e, "Relay closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(paths: &[&str]) -> Vec<Route> {
        paths
            .iter()
            .map(|p| Route::new(p, "sleep", vec![]))
            .collect()
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let routes = routes(&["/cli", "/cli/sub", "/other"]);

        assert_eq!(match_route(&routes, "/cli/sub/ws").unwrap().path, "/cli/sub");
        assert_eq!(match_route(&routes, "/cli/sub").unwrap().path, "/cli/sub");
        assert_eq!(match_route(&routes, "/cli/other").unwrap().path, "/cli");
        assert_eq!(match_route(&routes, "/cli").unwrap().path, "/cli");
        assert_eq!(match_route(&routes, "/other/x").unwrap().path, "/other");
    }

    #[test]
    fn test_prefix_is_segment_aware() {
        let routes = routes(&["/cli"]);
        assert!(match_route(&routes, "/client").is_none());
        assert!(match_route(&routes, "/cl").is_none());
        assert!(match_route(&routes, "/").is_none());
    }

    #[test]
    fn test_root_route_catches_all() {
        let routes = routes(&["/", "/cli"]);
        assert_eq!(match_route(&routes, "/anything").unwrap().path, "/");
        assert_eq!(match_route(&routes, "/cli/ws").unwrap().path, "/cli");
        assert_eq!(match_route(&routes, "/").unwrap().path, "/");
    }

    #[test]
    fn test_backend_path_strips_prefix() {
        assert_eq!(backend_path_and_query("/cli", &request("/cli/ws")), "/ws");
        assert_eq!(backend_path_and_query("/cli", &request("/cli")), "/");
        assert_eq!(
            backend_path_and_query("/cli", &request("/cli/ws?arg=x&b=2")),
            "/ws?arg=x&b=2"
        );
        assert_eq!(
            backend_path_and_query("/", &request("/deep/path")),
            "/deep/path"
        );
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .uri("/cli/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .uri("/cli/ws")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = request("/cli");
        assert!(!is_upgrade_request(&req));

        // Upgrade header without Connection: upgrade is not an upgrade
        let req = Request::builder()
            .uri("/cli/ws")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_origin_check() {
        let req = Request::builder()
            .uri("/cli/ws")
            .header("Host", "example.com:8000")
            .header("Origin", "http://example.com:8000")
            .body(())
            .unwrap();
        assert!(origin_allowed(&req));

        let req = Request::builder()
            .uri("/cli/ws")
            .header("Host", "example.com")
            .header("Origin", "https://evil.test")
            .body(())
            .unwrap();
        assert!(!origin_allowed(&req));

        // No Origin header: non-browser client, allowed
        let req = Request::builder()
            .uri("/cli/ws")
            .header("Host", "example.com")
            .body(())
            .unwrap();
        assert!(origin_allowed(&req));

        // Origin without a Host to compare against is rejected
        let req = Request::builder()
            .uri("/cli/ws")
            .header("Origin", "http://example.com")
            .body(())
            .unwrap();
        assert!(!origin_allowed(&req));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc123\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Sec-WebSocket-Accept" && v == "abc123"));

        let raw = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let (status, _) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_header_end_splits_head_from_relay_payload() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x1b[2Jscreen";
        let end = header_end(raw).unwrap();
        assert_eq!(&raw[end..], b"\x1b[2Jscreen");

        let (status, _) = parse_upgrade_response(&raw[..end]).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);

        // Head split across reads has no terminator yet
        assert_eq!(header_end(b"HTTP/1.1 101 Switching Protocols\r\nUpgr"), None);
    }

    #[test]
    fn test_build_upgrade_request_rewrites_path_and_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/cli/ws")
            .header("Host", "public.example.com")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", "k")
            .body(())
            .unwrap();

        let raw = build_upgrade_request(&req, 7681, "/ws");
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1:7681\r\n"));
        assert!(!text.contains("public.example.com"));
        assert!(text.contains("sec-websocket-key: k\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
