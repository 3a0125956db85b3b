//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Library-level errors for startup and process lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The terminal backend binary could not be located or is unusable.
    /// Fatal: aborts startup.
    #[error("failed to provision backend binary: {0}")]
    Provisioning(String),

    /// No bindable port could be found for a route. Fatal for that route only.
    #[error("no free port for route {route} after {probes} probes")]
    PortExhaustion { route: String, probes: u32 },

    /// Launching the backend command failed. Triggers the restart policy.
    #[error("failed to spawn backend for route {route}: {source}")]
    ProcessSpawn {
        route: String,
        #[source]
        source: std::io::Error,
    },

    /// A backend exited unexpectedly. Triggers the restart policy.
    #[error("backend for route {route} exited unexpectedly")]
    ProcessCrash { route: String },

    /// Invalid or duplicate route configuration. Fatal at load time.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

/// Error kinds surfaced to clients in proxy error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyErrorKind {
    /// No route prefix matches the request path
    RouteNotFound,
    /// Backend is still starting; retry shortly
    Starting,
    /// Backend crashed and a restart is pending
    Crashed,
    /// Backend exhausted its restart budget and will not be retried
    TerminalUnavailable,
    /// Backend was stopped by an explicit shutdown
    Stopped,
    /// Route is at its configured concurrent-session limit
    SessionLimit,
    /// Same-origin check failed for a WebSocket upgrade
    OriginForbidden,
    /// Could not connect to or converse with the backend
    UpstreamConnect,
    /// Backend rejected or mangled the upgrade handshake
    UpgradeFailed,
    /// Request could not be interpreted
    BadRequest,
}

impl ProxyErrorKind {
    /// Default HTTP status for this error kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorKind::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorKind::Starting => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::Crashed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::TerminalUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::SessionLimit => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::OriginForbidden => StatusCode::FORBIDDEN,
            ProxyErrorKind::UpstreamConnect => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::UpgradeFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Error kind as a string for the X-Termgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorKind::RouteNotFound => "route_not_found",
            ProxyErrorKind::Starting => "starting",
            ProxyErrorKind::Crashed => "crashed",
            ProxyErrorKind::TerminalUnavailable => "terminal_unavailable",
            ProxyErrorKind::Stopped => "stopped",
            ProxyErrorKind::SessionLimit => "session_limit",
            ProxyErrorKind::OriginForbidden => "origin_forbidden",
            ProxyErrorKind::UpstreamConnect => "upstream_connect",
            ProxyErrorKind::UpgradeFailed => "upgrade_failed",
            ProxyErrorKind::BadRequest => "bad_request",
        }
    }
}

/// JSON error response body: `{"error": ..., "route": ..., "detail": ...}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error kind
    pub error: ProxyErrorKind,
    /// The route prefix the request matched, if any
    pub route: Option<String>,
    /// Human-readable detail
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(error: ProxyErrorKind, route: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            error,
            route: route.map(String::from),
            detail: detail.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","route":null,"detail":"{}"}}"#,
                self.error.as_header_value(),
                self.detail.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with the X-Termgate-Error header set
pub fn json_error_response(
    kind: ProxyErrorKind,
    route: Option<&str>,
    detail: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(kind, route, detail);
    let body = error.to_json();

    Response::builder()
        .status(kind.status_code())
        .header("Content-Type", "application/json")
        .header("X-Termgate-Error", kind.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
