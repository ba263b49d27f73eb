// HTTP server bootstrap.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::domain::{AgentTraceError, Result};

use super::routes::create_router;
use super::state::AppState;

pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| AgentTraceError::config(format!("invalid server address: {e}")))
    }

    /// Serve until the shutdown future resolves, then stop accepting.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.socket_addr()?;
        let app = create_router(self.state);

        info!(%addr, "API server listening");
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("API server stopped");
        Ok(())
    }
}
