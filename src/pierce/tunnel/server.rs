use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::pierce::{config::ServerConfig, tunnel::registry::Registry};

/// The relay: accepts tunnel connections from clients and hands them to
/// the registry.
pub struct Server {
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            registry: Registry::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured relay port and serve until shutdown.
    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let port = self.registry.config().port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind relay port {port}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serve tunnel registrations on an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("relay listener address")?;
        tracing::info!(
            addr = %addr,
            access_ports = %format!(
                "{}-{}",
                self.registry.config().min_access_port,
                self.registry.config().max_access_port
            ),
            "relay: listening for tunnel connections"
        );

        tokio::spawn(self.registry.clone().run_heartbeat(shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = listener.accept() => {
                    let (conn, peer) = res.context("accept tunnel connection")?;
                    tracing::debug!(peer = %peer, "relay: tunnel connection accepted");
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        registry.handle_tunnel_connection(conn).await;
                    });
                }
            }
        }

        tracing::info!("relay: shutting down, closing tunnel contexts");
        self.registry.shutdown();
        Ok(())
    }
}
