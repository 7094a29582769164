//! Streaming forwarder to the backend
//!
//! Requests are re-targeted at the backend address and sent through a pooled
//! HTTP client. Bodies are streamed in both directions; nothing is buffered.

use crate::error::ForwardError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type handed to the backend client
pub type ForwardBody = BoxBody<Bytes, hyper::Error>;

/// Statistics for the forwarder
#[derive(Debug, Default)]
pub struct ForwarderStats {
    forwarded: AtomicU64,
    failures: AtomicU64,
}

impl ForwarderStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwards requests unmodified to a fixed backend address
pub struct ProxyForwarder {
    /// `host:port` of the backend, fixed at startup
    target: String,
    client: Client<HttpConnector, ForwardBody>,
    stats: Arc<ForwarderStats>,
}

impl ProxyForwarder {
    pub fn new(target: impl Into<String>, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let target: String = target.into();
        debug!(
            backend = %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Forwarder initialized"
        );

        Self {
            target,
            client,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the backend and return its response with the body
    /// still streaming.
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ForwardBody>, ForwardError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let result = self.send(req).await;
        match result {
            Ok(_) => self.stats.forwarded.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn send<B>(&self, req: Request<B>) -> Result<Response<ForwardBody>, ForwardError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let uri = self.backend_uri(&req);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        // Headers pass through untouched, including Host.
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body.boxed())
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Absolute URI on the backend for an origin-, absolute- or asterisk-form
    /// request. The pooled client always sends origin-form, so `*` goes out as `/`.
    fn backend_uri<B>(&self, req: &Request<B>) -> String {
        let path = match req.uri().path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq,
            _ => "/",
        };
        format!("http://{}{}", self.target, path)
    }
}
