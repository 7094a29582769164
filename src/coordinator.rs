//! Per-request control point
//!
//! Every application request passes through [`Coordinator::handle_request`],
//! which under one mutex makes sure the backend is running, replaces the idle
//! timer, and then forwards the request outside the lock.
//!
//! The mutex is held across a cold start. Requests that arrive while the
//! backend is starting queue on the lock and find it running once they get
//! in, so concurrent cold-start requests spawn exactly one process.

use crate::config::Config;
use crate::error::{json_error_response, LaunchError, ProxyErrorCode};
use crate::forwarder::{ForwardBody, PoolConfig, ProxyForwarder};
use crate::launcher::{LauncherStats, ProcessLauncher};
use crate::timer::IdleTimer;
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Signals from the serving layer that are not application traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The listener is bound and accepting connections
    Startup,
    /// The listener stopped; the backend must not outlive the supervisor
    Shutdown,
}

/// A unit of work handed to the coordinator
#[derive(Debug)]
pub enum Inbound<B> {
    Request(Request<B>),
    Lifecycle(LifecycleEvent),
}

/// How an inbound unit takes part in the start/timer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary HTTP request: starts the backend and re-arms the idle timer
    Application,
    /// Server lifecycle signal, handled locally
    Lifecycle,
    /// Tunnel or server-wide request (`CONNECT`, `OPTIONS *`). Never starts
    /// the backend; `CONNECT` is refused outright.
    Other,
}

impl RequestKind {
    pub fn classify<B>(req: &Request<B>) -> Self {
        if req.method() == Method::CONNECT || req.uri().path() == "*" {
            RequestKind::Other
        } else {
            RequestKind::Application
        }
    }
}

impl<B> Inbound<B> {
    pub fn kind(&self) -> RequestKind {
        match self {
            Inbound::Request(req) => RequestKind::classify(req),
            Inbound::Lifecycle(_) => RequestKind::Lifecycle,
        }
    }
}

/// Backend liveness plus the current idle timer. Only touched with the
/// coordinator's mutex held.
struct SupervisorState {
    launcher: ProcessLauncher,
    timer: Option<IdleTimer>,
    /// Bumped whenever the timer is replaced or cleared; a fired callback
    /// whose generation is no longer current does nothing.
    generation: u64,
}

impl SupervisorState {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.generation += 1;
    }

    /// Drop the handle of a backend that died on its own
    fn reap_exited(&mut self) {
        if let Some(status) = self.launcher.reap_exited() {
            warn!(?status, "Backend is gone, it will be restarted on the next request");
            self.clear_timer();
        }
    }
}

pub struct Coordinator {
    state: Mutex<SupervisorState>,
    forwarder: ProxyForwarder,
    idle_timeout: Duration,
    launcher_stats: Arc<LauncherStats>,
    /// Flips to true once shutdown begins; never flips back
    shutting_down: watch::Sender<bool>,
    /// Handed to idle timer callbacks so a pending timer does not keep the
    /// coordinator alive.
    self_ref: Weak<Coordinator>,
}

impl Coordinator {
    /// Build a coordinator from the effective configuration
    pub fn new(config: &Config) -> Arc<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: config.server.pool_idle_timeout(),
        };
        Self::with_parts(
            ProcessLauncher::new(config.backend.clone()),
            ProxyForwarder::new(config.backend.target(), pool_config),
            config.backend.idle_timeout(),
        )
    }

    pub fn with_parts(
        launcher: ProcessLauncher,
        forwarder: ProxyForwarder,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let launcher_stats = launcher.stats();
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(SupervisorState {
                launcher,
                timer: None,
                generation: 0,
            }),
            forwarder,
            idle_timeout,
            launcher_stats,
            shutting_down: watch::Sender::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn launcher_stats(&self) -> Arc<LauncherStats> {
        Arc::clone(&self.launcher_stats)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutting_down.borrow()
    }

    pub async fn is_backend_running(&self) -> bool {
        self.state.lock().await.launcher.is_running()
    }

    /// Route an inbound unit by kind. Lifecycle events produce no response.
    pub async fn dispatch<B>(&self, inbound: Inbound<B>) -> Option<Response<ForwardBody>>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        match inbound {
            Inbound::Lifecycle(event) => {
                self.on_lifecycle(event).await;
                None
            }
            Inbound::Request(req) => Some(self.handle_request(req).await),
        }
    }

    /// Run the start/timer protocol for a request and forward it
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<ForwardBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kind = RequestKind::classify(&req);

        debug!(method = %req.method(), uri = %req.uri(), request_id, ?kind, "Incoming request");

        if req.method() == Method::CONNECT {
            debug!(request_id, uri = %req.uri(), "Refusing CONNECT tunnel");
            return json_error_response(
                ProxyErrorCode::TunnelNotSupported,
                "CONNECT tunnels are not supported",
            );
        }

        if kind == RequestKind::Application {
            if let Err(e) = self.ensure_running_and_rearm().await {
                // Details stay in the log, the caller gets a generic message.
                match e {
                    LaunchError::ShuttingDown => warn!(request_id, "Rejecting request during shutdown"),
                    _ => error!(request_id, error = %e, "Backend unavailable"),
                }
                return json_error_response(e.error_code(), "Backend unavailable");
            }
        } else {
            let running = {
                let mut state = self.state.lock().await;
                state.reap_exited();
                state.launcher.is_running()
            };
            if !running {
                debug!(request_id, "Backend not running, not starting it for this request");
                return json_error_response(
                    ProxyErrorCode::BackendNotRunning,
                    "Backend is not running",
                );
            }
        }

        match self.forwarder.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(request_id, backend = self.forwarder.target(), error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
        }
    }

    /// Make sure the backend is running, then replace the idle timer.
    ///
    /// Refused once shutdown has begun. A cold start in progress is abandoned
    /// when shutdown begins; the half-started process stays recorded so that
    /// [`shutdown`](Self::shutdown) terminates it gracefully.
    async fn ensure_running_and_rearm(&self) -> Result<(), LaunchError> {
        let mut state = self.state.lock().await;
        if self.is_shutting_down() {
            return Err(LaunchError::ShuttingDown);
        }
        state.reap_exited();

        if !state.launcher.is_running() {
            info!("Backend not running, starting it");
            let mut shutdown_rx = self.shutting_down.subscribe();
            tokio::select! {
                result = state.launcher.start() => result?,
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown began during cold start, abandoning it");
                    return Err(LaunchError::ShuttingDown);
                }
            }
        }

        state.clear_timer();
        let generation = state.generation;
        let coordinator = self.self_ref.clone();
        state.timer = Some(IdleTimer::schedule(self.idle_timeout, move || async move {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.idle_stop(generation).await;
            }
        }));

        Ok(())
    }

    /// Idle timer callback: stop the backend unless the timer was superseded
    async fn idle_stop(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(generation, current = state.generation, "Stale idle timer, ignoring");
            return;
        }

        state.timer = None;
        state.generation += 1;
        if state.launcher.is_running() {
            info!(idle_secs = self.idle_timeout.as_secs(), "Idle timeout reached, stopping backend");
            state.launcher.stop();
        }
    }

    pub async fn on_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Startup => {
                info!(
                    backend = self.forwarder.target(),
                    idle_timeout_secs = self.idle_timeout.as_secs(),
                    "Supervisor ready, backend starts on first request"
                );
            }
            LifecycleEvent::Shutdown => self.shutdown().await,
        }
    }

    /// Refuse further starts, cancel the idle timer and terminate the
    /// backend, waiting for it to exit
    pub async fn shutdown(&self) {
        self.shutting_down.send_replace(true);
        let mut state = self.state.lock().await;
        state.clear_timer();
        if state.launcher.is_running() {
            info!("Stopping backend for shutdown");
        }
        state.launcher.shutdown().await;
    }
}

/// Resolves once the shutdown flag is set
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use http_body_util::{BodyExt, Empty};
    use hyper::StatusCode;

    fn empty_request(method: Method, uri: &str) -> Request<ForwardBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn script_coordinator(script: &str) -> Arc<Coordinator> {
        let mut config = Config::default();
        config.backend = BackendConfig::new("sh", free_port())
            .with_args(vec!["-c".to_string(), script.to_string(), "backend".to_string()]);
        config.backend.probe_interval_ms = 50;
        config.backend.startup_timeout_secs = 5;
        config.backend.idle_timeout_secs = 60;
        Coordinator::new(&config)
    }

    #[test]
    fn test_classify_requests() {
        assert_eq!(
            RequestKind::classify(&empty_request(Method::GET, "/v1/health")),
            RequestKind::Application
        );
        assert_eq!(
            RequestKind::classify(&empty_request(Method::POST, "http://localhost/v1/completions")),
            RequestKind::Application
        );
        assert_eq!(
            RequestKind::classify(&empty_request(Method::OPTIONS, "*")),
            RequestKind::Other
        );
        assert_eq!(
            RequestKind::classify(&empty_request(Method::CONNECT, "localhost:443")),
            RequestKind::Other
        );
    }

    #[test]
    fn test_inbound_kind() {
        let event: Inbound<ForwardBody> = Inbound::Lifecycle(LifecycleEvent::Startup);
        assert_eq!(event.kind(), RequestKind::Lifecycle);

        let req = Inbound::Request(empty_request(Method::GET, "/"));
        assert_eq!(req.kind(), RequestKind::Application);
    }

    #[tokio::test]
    async fn test_other_request_does_not_start_backend() {
        let coordinator = script_coordinator("exec sleep 30");

        let response = coordinator
            .handle_request(empty_request(Method::OPTIONS, "*"))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_NOT_RUNNING"
        );
        assert_eq!(coordinator.launcher_stats().starts(), 0);
        assert!(!coordinator.is_backend_running().await);
    }

    #[tokio::test]
    async fn test_lifecycle_events_do_not_start_backend() {
        let coordinator = script_coordinator("exec sleep 30");

        let response = coordinator
            .dispatch(Inbound::<ForwardBody>::Lifecycle(LifecycleEvent::Startup))
            .await;
        assert!(response.is_none());

        coordinator.on_lifecycle(LifecycleEvent::Shutdown).await;
        assert_eq!(coordinator.launcher_stats().starts(), 0);
        assert_eq!(coordinator.launcher_stats().stops(), 0);
    }

    #[tokio::test]
    async fn test_startup_failure_is_gateway_error() {
        let coordinator = script_coordinator("exit 7");

        let response = coordinator
            .handle_request(empty_request(Method::GET, "/"))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_START_FAILED"
        );
        assert!(!coordinator.is_backend_running().await);

        // The supervisor stays usable and retries on the next request.
        let response = coordinator
            .handle_request(empty_request(Method::GET, "/"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(coordinator.launcher_stats().starts(), 2);
        assert_eq!(coordinator.launcher_stats().startup_failures(), 2);
    }

    #[tokio::test]
    async fn test_stale_idle_callback_is_ignored() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = BackendConfig::new("sh", port)
            .with_args(vec!["-c".to_string(), "exec sleep 30".to_string(), "backend".to_string()]);
        config.probe_interval_ms = 50;
        let coordinator = Coordinator::with_parts(
            ProcessLauncher::new(config.clone()),
            ProxyForwarder::new(config.target(), PoolConfig::default()),
            Duration::from_secs(60),
        );

        coordinator.ensure_running_and_rearm().await.unwrap();
        let stale = coordinator.state.lock().await.generation;
        coordinator.ensure_running_and_rearm().await.unwrap();

        // A callback from the first timer that fired late must not stop the backend.
        coordinator.idle_stop(stale).await;
        assert!(coordinator.is_backend_running().await);
        assert_eq!(coordinator.launcher_stats().stops(), 0);

        let current = coordinator.state.lock().await.generation;
        coordinator.idle_stop(current).await;
        assert!(!coordinator.is_backend_running().await);
        assert_eq!(coordinator.launcher_stats().stops(), 1);

        coordinator.shutdown().await;
        assert_eq!(coordinator.launcher_stats().starts(), 1);
    }

    #[tokio::test]
    async fn test_huge_idle_timeout_does_not_overflow() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default();
        config.backend = BackendConfig::new("sh", port)
            .with_args(vec!["-c".to_string(), "exec sleep 30".to_string(), "backend".to_string()]);
        config.backend.probe_interval_ms = 50;
        config.backend.idle_timeout_secs = u64::MAX;
        assert!(config.validate().is_ok());
        let coordinator = Coordinator::new(&config);

        coordinator.ensure_running_and_rearm().await.unwrap();
        assert!(coordinator.is_backend_running().await);
        {
            let state = coordinator.state.lock().await;
            let timer = state.timer.as_ref().expect("idle timer armed");
            assert_eq!(timer.state(), crate::timer::TimerState::Pending);
        }

        // Re-arming on the next request works the same way.
        coordinator.ensure_running_and_rearm().await.unwrap();
        assert_eq!(coordinator.launcher_stats().starts(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_is_refused_locally() {
        let coordinator = script_coordinator("exec sleep 30");

        let response = coordinator
            .handle_request(empty_request(Method::CONNECT, "example.com:443"))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "TUNNEL_NOT_SUPPORTED"
        );
        assert_eq!(coordinator.launcher_stats().starts(), 0);
    }

    #[tokio::test]
    async fn test_request_after_shutdown_does_not_start_backend() {
        let coordinator = script_coordinator("exec sleep 30");

        coordinator.on_lifecycle(LifecycleEvent::Shutdown).await;
        assert!(coordinator.is_shutting_down());

        let err = coordinator.ensure_running_and_rearm().await.unwrap_err();
        assert!(matches!(err, LaunchError::ShuttingDown));

        let response = coordinator
            .handle_request(empty_request(Method::GET, "/"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_SHUTTING_DOWN"
        );

        assert_eq!(coordinator.launcher_stats().starts(), 0);
        assert!(!coordinator.is_backend_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_cold_start() {
        // Nothing listens on the backend port, so the start waits for readiness.
        let mut config = Config::default();
        config.backend = BackendConfig::new("sh", free_port())
            .with_args(vec!["-c".to_string(), "exec sleep 30".to_string(), "backend".to_string()]);
        config.backend.probe_interval_ms = 50;
        config.backend.startup_timeout_secs = 600;
        config.backend.shutdown_grace_period_secs = 1;
        let coordinator = Coordinator::new(&config);

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .handle_request(empty_request(Method::GET, "/"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(coordinator.launcher_stats().starts(), 1);

        let finished = tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown()).await;
        assert!(finished.is_ok(), "shutdown waited on the cold start");

        let response = pending.await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_SHUTTING_DOWN"
        );

        // The half-started process was stopped gracefully, not leaked.
        assert!(!coordinator.is_backend_running().await);
        assert_eq!(coordinator.launcher_stats().stops(), 1);
    }
}
