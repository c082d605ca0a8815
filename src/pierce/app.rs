use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::pierce::{
    config::{self, ClientOverrides, ServerOverrides},
    identity, logging,
    tunnel::{client, server},
};

/// Which side of the tunnel this process runs, with its CLI overrides.
pub enum Mode {
    Server(ServerOverrides),
    Client(ClientOverrides),
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path);
    let file = match &path {
        Some(p) => config::load_file(p)?,
        None => config::FileConfig::default(),
    };

    let _log_guard = logging::init(&file.logging)?;
    if let Some(p) = &path {
        tracing::info!(config = %p.display(), "pierce: loaded config file");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    match mode {
        Mode::Server(overrides) => {
            let cfg = config::server_config(file.server, overrides)?;
            tracing::info!(
                port = cfg.port,
                access_ports = %format!("{}-{}", cfg.min_access_port, cfg.max_access_port),
                "pierce: starting relay"
            );
            let server = server::Server::new(cfg);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.listen_and_serve(shutdown).await });
        }
        Mode::Client(overrides) => {
            let cfg = config::client_config(file.client, overrides)?;
            let id = identity::client_id()?;
            tracing::info!(
                relay = %cfg.server_addr,
                mappings = cfg.locals.len(),
                tunnels = cfg.tunnel_count,
                id = %id,
                "pierce: starting client"
            );
            let client = client::Client::new(cfg, id);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                client
                    .run(shutdown)
                    .await
                    .context("tunnel client stopped")
            });
        }
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Give tasks a moment to observe the shutdown signal, then cut them off.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
