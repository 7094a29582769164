use crate::coordinator::{Coordinator, Inbound, LifecycleEvent};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The public listening endpoint
pub struct ProxyServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket. Binding happens here rather than in
    /// [`run`](Self::run) so callers can learn the actual address (port 0).
    pub async fn bind(
        bind_addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            coordinator,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled, then stop the backend
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        self.coordinator
            .dispatch(Inbound::<Incoming>::Lifecycle(LifecycleEvent::Startup))
            .await;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let coordinator = Arc::clone(&self.coordinator);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, coordinator).await {
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
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        self.coordinator
            .dispatch(Inbound::<Incoming>::Lifecycle(LifecycleEvent::Shutdown))
            .await;

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, coordinator: Arc<Coordinator>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let coordinator = Arc::clone(&coordinator);
        async move { Ok::<_, hyper::Error>(coordinator.handle_request(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
