//! Server lifecycle: HTTP and gRPC listeners with graceful shutdown.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{routes::create_router, rpc::ChatCompletionServer, state::AppState};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address
    pub addr: SocketAddr,
    /// gRPC bind address; the gRPC surface is off when unset
    pub rpc_addr: Option<SocketAddr>,
    /// How long in-flight calls may run after shutdown starts
    pub shutdown_grace: Duration,
}

/// Server startup or runtime failure
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Could not bind a listener
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address
        addr: SocketAddr,
        /// Cause
        source: std::io::Error,
    },
    /// HTTP server failed
    #[error("HTTP server error: {0}")]
    Http(#[source] std::io::Error),
    /// gRPC server failed
    #[error("gRPC server error: {0}")]
    Rpc(#[from] tonic::transport::Error),
}

/// The gateway server
#[derive(Debug)]
pub struct Server {
    state: AppState,
    config: ServerConfig,
}

impl Server {
    /// Create a server
    #[must_use]
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Listeners stop accepting at once; in-flight calls get the grace period,
    /// then their call contexts are cancelled.
    ///
    /// # Errors
    /// Returns error if a listener cannot bind or a server fails
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Self { state, config } = self;
        let calls = state.calls.clone();

        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.addr,
                source,
            })?;
        info!(addr = %config.addr, "HTTP server listening");

        let grace = config.shutdown_grace;
        let grace_token = shutdown.clone();
        let grace_calls = calls.clone();
        let grace_timer = tokio::spawn(async move {
            grace_token.cancelled().await;
            tokio::time::sleep(grace).await;
            if !grace_calls.is_cancelled() {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Shutdown grace expired, cancelling in-flight calls"
                );
                grace_calls.cancel();
            }
        });

        let rpc = config.rpc_addr.map(|addr| {
            let service = ChatCompletionServer::new(state.clone());
            let token = shutdown.clone();
            info!(addr = %addr, "gRPC server listening");
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_shutdown(addr, token.cancelled_owned())
                    .await
            })
        });

        let app = create_router(state);
        let http_token = shutdown.clone();
        let http = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { http_token.cancelled().await })
        .await
        .map_err(ServerError::Http);

        // Stop the gRPC side too if HTTP ended on its own
        shutdown.cancel();

        let rpc = match rpc {
            Some(handle) => match handle.await {
                Ok(result) => result.map_err(ServerError::from),
                Err(e) => {
                    error!(error = %e, "gRPC server task failed");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        calls.cancel();
        grace_timer.abort();
        info!("Server stopped");

        http.and(rpc)
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
