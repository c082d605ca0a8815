use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::pierce::{
    config::{ClientConfig, NetAddress},
    net,
    tunnel::protocol::{self, ClientId, Code, Message, PROTOCOL_VERSION},
};

/// Unrecoverable registration outcomes. These are operator-configuration
/// errors; the owning process decides how to act (the CLI exits).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("relay rejected protocol version {PROTOCOL_VERSION}, upgrade client or relay")]
    VersionMismatch,
    #[error("relay rejected the auth key")]
    AuthFailure,
    #[error("access port {0} is outside the relay's allowed range")]
    IllegalAccessPort(u32),
    #[error("access port {0} is already owned by another client")]
    PortOccupied(u32),
    #[error("relay rejected the registration")]
    Rejected,
    #[error("could not send the registration request")]
    RegistrationSend,
}

/// Maintains the configured number of tunnel connections per mapped local
/// service and bridges them to the real local ports when the relay signals
/// a visitor.
pub struct Client {
    config: ClientConfig,
    client_id: ClientId,
}

impl Client {
    pub fn new(config: ClientConfig, client_id: ClientId) -> Self {
        Client { config, client_id }
    }

    /// Run every mapping until shutdown or the first fatal registration
    /// error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ClientError>(1);

        let mut mappings = JoinSet::new();
        for local in self.config.locals.clone() {
            mappings.spawn(maintain_mapping(
                self.config.clone(),
                self.client_id,
                local,
                fatal_tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(fatal_tx);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        mappings.abort_all();
                        return Ok(());
                    }
                }
                err = fatal_rx.recv() => {
                    mappings.abort_all();
                    return Err(err.unwrap_or(ClientError::Rejected));
                }
            }
        }
    }
}

/// One mapping's lifetime: a builder loop fed by "need a tunnel" signals,
/// and a bridge loop fed by tunnels the relay has signalled into service.
async fn maintain_mapping(
    config: ClientConfig,
    client_id: ClientId,
    local: NetAddress,
    fatal_tx: mpsc::Sender<ClientError>,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = config.tunnel_count;
    let (need_tx, mut need_rx) = mpsc::channel::<()>(slots * 2);
    let (ready_tx, ready_rx) = mpsc::channel::<TcpStream>(slots);

    tokio::spawn(bridge_loop(
        local.clone(),
        ready_rx,
        need_tx.clone(),
        shutdown.clone(),
    ));

    // Establish the steady-state pool size at the relay.
    for _ in 0..slots {
        let _ = need_tx.send(()).await;
    }
    tracing::info!(local = %local, access_port = local.port2, tunnels = slots, "tunnel: mapping initialized");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            sig = need_rx.recv() => {
                if sig.is_none() {
                    return;
                }
                tokio::spawn(build_tunnel(
                    config.clone(),
                    client_id,
                    local.port2 as u32,
                    need_tx.clone(),
                    ready_tx.clone(),
                    fatal_tx.clone(),
                ));
            }
        }
    }
}

/// Dial the relay, register, and wait to be signalled into service.
///
/// `HeartBeat` keeps the wait alive; `Success` hands the connection to the
/// bridge loop; rejection codes are fatal; anything else is a transient
/// interruption that rebuilds the tunnel.
async fn build_tunnel(
    config: ClientConfig,
    client_id: ClientId,
    access_port: u32,
    need_tx: mpsc::Sender<()>,
    ready_tx: mpsc::Sender<TcpStream>,
    fatal_tx: mpsc::Sender<ClientError>,
) {
    let relay = config.server_addr.dial_addr();
    let Some(mut conn) = net::dial(&relay, Some(net::MAX_REDIALS)).await else {
        tracing::error!(relay = %relay, "tunnel: relay unreachable, abandoning this tunnel slot");
        return;
    };

    let request = Message::request(access_port, client_id, config.key.clone());
    if protocol::send(&mut conn, &request).await.is_err() {
        let _ = fatal_tx.send(ClientError::RegistrationSend).await;
        return;
    }

    loop {
        let response = protocol::receive(&mut conn).await;
        match response.code {
            // Liveness probe from the relay; keep waiting.
            Code::HeartBeat => {}
            Code::Success => {
                tracing::info!(access_port, "tunnel: signalled into service");
                let _ = ready_tx.send(conn).await;
                return;
            }
            Code::VersionMismatch => {
                let _ = fatal_tx.send(ClientError::VersionMismatch).await;
                return;
            }
            Code::AuthFailure => {
                let _ = fatal_tx.send(ClientError::AuthFailure).await;
                return;
            }
            Code::IllegalAccessPort => {
                let _ = fatal_tx.send(ClientError::IllegalAccessPort(access_port)).await;
                return;
            }
            Code::PortOccupied => {
                let _ = fatal_tx.send(ClientError::PortOccupied(access_port)).await;
                return;
            }
            Code::Fail => {
                let _ = fatal_tx.send(ClientError::Rejected).await;
                return;
            }
            // Usually a receive timeout or an interrupted relay; rebuild.
            Code::ReceiveFailure | Code::Unknown(_) => {
                tracing::debug!(
                    access_port,
                    code = response.code.as_u8(),
                    "tunnel: connection interrupted, redialing"
                );
                let _ = need_tx.send(()).await;
                return;
            }
        }
    }
}

/// Pair each in-service tunnel with a fresh local connection and bridge
/// them.
async fn bridge_loop(
    local: NetAddress,
    mut ready_rx: mpsc::Receiver<TcpStream>,
    need_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            tunnel = ready_rx.recv() => {
                let Some(tunnel) = tunnel else { return };
                tokio::spawn(bridge_one(local.clone(), tunnel, need_tx.clone()));
            }
        }
    }
}

async fn bridge_one(local: NetAddress, tunnel: TcpStream, need_tx: mpsc::Sender<()>) {
    // Local services get a single dial attempt: if the mapping is
    // misconfigured, retrying would not help.
    match net::dial(&local.dial_addr(), Some(0)).await {
        Some(local_conn) => {
            // Replenish before bridging so capacity never dips below
            // target while this pair is busy.
            let _ = need_tx.send(()).await;
            tracing::debug!(local = %local, "tunnel: bridging local service");
            net::forward(local_conn, tunnel).await;
        }
        None => {
            tracing::warn!(local = %local, "tunnel: local service unreachable, recycling tunnel");
            drop(tunnel);
            let _ = need_tx.send(()).await;
        }
    }
}
