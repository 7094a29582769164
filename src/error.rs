//! Error types and JSON gateway error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Response header naming the gateway error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Errors from launching the backend and waiting for it to accept connections
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to spawn backend '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited before it accepted a connection. `exit_code` is
    /// `None` when the process was killed by a signal.
    #[error("backend exited unexpectedly with code {}", display_code(.exit_code))]
    StartupFailure { exit_code: Option<i32> },

    #[error("backend not ready after {} seconds", .0.as_secs())]
    ReadinessTimeout(Duration),

    #[error("invalid backend command: {0}")]
    InvalidCommand(String),

    /// Shutdown began before the backend could be (re)started
    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("I/O error while waiting for backend: {0}")]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (terminated by signal)".to_string())
}

impl LaunchError {
    /// The gateway error code reported to the caller for this failure
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            LaunchError::ReadinessTimeout(_) => ProxyErrorCode::StartupTimeout,
            LaunchError::ShuttingDown => ProxyErrorCode::BackendShuttingDown,
            _ => ProxyErrorCode::BackendStartFailed,
        }
    }
}

/// Network failure while talking to a running backend
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend failed to spawn or exited during startup
    BackendStartFailed,
    /// Backend did not become ready within the startup bound
    StartupTimeout,
    /// Backend is stopped and the request may not start it
    BackendNotRunning,
    /// Supervisor is shutting down and will not start the backend
    BackendShuttingDown,
    /// Failed to talk to a running backend
    ConnectionFailed,
    /// `CONNECT` tunnels are not proxied
    TunnelNotSupported,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::StartupTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BackendNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::TunnelNotSupported => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::StartupTimeout => "STARTUP_TIMEOUT",
            ProxyErrorCode::BackendNotRunning => "BACKEND_NOT_RUNNING",
            ProxyErrorCode::BackendShuttingDown => "BACKEND_SHUTTING_DOWN",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::TunnelNotSupported => "TUNNEL_NOT_SUPPORTED",
        }
    }
}

/// Body of a gateway error answered by the supervisor itself
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }
}

/// Build a JSON gateway error carrying the code in `X-Proxy-Error`
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let json = serde_json::to_vec(&ErrorResponse::new(code, message))
        .unwrap_or_else(|_| code.as_header_value().as_bytes().to_vec());

    let mut response = Response::new(Full::new(Bytes::from(json)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()));
    response
}
