use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use pierce::{
    config::{ClientConfig, ServerConfig},
    tunnel::{
        client::{Client, ClientError},
        protocol::{self, CLIENT_ID_LEN, ClientId, Code, Message, PROTOCOL_VERSION},
        registry::Registry,
        server::Server,
    },
};

fn id(fill: u8) -> ClientId {
    ClientId::from([fill; CLIENT_ID_LEN])
}

async fn free_port() -> u16 {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    ln.local_addr().unwrap().port()
}

async fn wait_for(cond: impl Fn() -> bool, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Relay on an ephemeral port; returns its port, registry, and shutdown
/// handle.
async fn start_relay(key: &str) -> (u16, Arc<Registry>, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(ServerConfig::new(key, port, 1024, 65535).unwrap());
    let registry = server.registry().clone();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move { server.serve(listener, rx).await });
    (port, registry, tx)
}

/// Stand-in for the NAT'ed local service: echoes every byte back.
async fn start_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn client_config(
    key: &str,
    relay_port: u16,
    local_port: u16,
    access_port: u16,
    tunnels: usize,
) -> ClientConfig {
    ClientConfig::new(
        key,
        format!("127.0.0.1:{relay_port}").parse().unwrap(),
        vec![format!("127.0.0.1:{local_port}:{access_port}")
            .parse()
            .unwrap()],
        tunnels,
    )
    .unwrap()
}

#[tokio::test]
async fn visitor_reaches_local_service_through_relay() {
    let (relay_port, registry, relay_shutdown) = start_relay("k1").await;
    let echo_port = start_echo().await;
    let access_port = free_port().await;

    let client = Client::new(
        client_config("k1", relay_port, echo_port, access_port, 2),
        id(b'a'),
    );
    let (client_shutdown, client_rx) = watch::channel(false);
    let client_task = tokio::spawn(async move { client.run(client_rx).await });

    wait_for(
        || {
            registry
                .context(access_port as u32)
                .is_some_and(|c| c.pool_len() >= 1)
        },
        "registration",
    )
    .await;

    let mut visitor = TcpStream::connect(("127.0.0.1", access_port)).await.unwrap();
    visitor.write_all(b"hello pierce").await.unwrap();
    let mut buf = [0u8; 12];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello pierce");
    drop(visitor);

    // The bridged tunnel is replaced; the pool returns to steady state.
    wait_for(
        || {
            registry
                .context(access_port as u32)
                .is_some_and(|c| c.pool_len() == 2)
        },
        "pool refill",
    )
    .await;

    // A later visitor reuses the mapping.
    let mut visitor = TcpStream::connect(("127.0.0.1", access_port)).await.unwrap();
    let payload = vec![0xabu8; 4096];
    visitor.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    visitor.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    let _ = client_shutdown.send(true);
    let _ = relay_shutdown.send(true);
    let _ = client_task.await;
}

#[tokio::test]
async fn visitors_wait_for_the_pool_to_refill() {
    let (relay_port, registry, relay_shutdown) = start_relay("k1").await;
    let echo_port = start_echo().await;
    let access_port = free_port().await;

    let client = Client::new(
        client_config("k1", relay_port, echo_port, access_port, 1),
        id(b'a'),
    );
    let (client_shutdown, client_rx) = watch::channel(false);
    let client_task = tokio::spawn(async move { client.run(client_rx).await });

    wait_for(
        || {
            registry
                .context(access_port as u32)
                .is_some_and(|c| c.pool_len() >= 1)
        },
        "registration",
    )
    .await;

    // With a single pooled tunnel, connecting every visitor up front
    // guarantees the later ones arrive against an empty pool and sit in
    // the accept loop until the client replenishes it.
    let mut visitors = Vec::new();
    for _ in 0..3 {
        visitors.push(TcpStream::connect(("127.0.0.1", access_port)).await.unwrap());
    }
    for (round, mut visitor) in visitors.into_iter().enumerate() {
        let payload = vec![b'a' + round as u8; 2048];
        visitor.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        visitor.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    let _ = client_shutdown.send(true);
    let _ = relay_shutdown.send(true);
    let _ = client_task.await;
}

#[tokio::test]
async fn bad_registrations_are_answered_with_a_code() {
    let (relay_port, registry, relay_shutdown) = start_relay("k1").await;

    // Stale protocol version.
    let mut conn = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
    let stale = Message {
        version: PROTOCOL_VERSION - 1,
        ..Message::request(15000, id(b'a'), "k1")
    };
    protocol::send(&mut conn, &stale).await.unwrap();
    assert_eq!(
        protocol::receive(&mut conn).await.code,
        Code::VersionMismatch
    );

    // Access port outside the relay's range.
    let mut conn = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
    protocol::send(&mut conn, &Message::request(80, id(b'a'), "k1"))
        .await
        .unwrap();
    assert_eq!(
        protocol::receive(&mut conn).await.code,
        Code::IllegalAccessPort
    );

    assert!(registry.is_empty());
    let _ = relay_shutdown.send(true);
}

#[tokio::test]
async fn wrong_key_is_fatal_for_the_client() {
    let (relay_port, _registry, relay_shutdown) = start_relay("k1").await;
    let echo_port = start_echo().await;
    let access_port = free_port().await;

    let client = Client::new(
        client_config("wrong", relay_port, echo_port, access_port, 1),
        id(b'a'),
    );
    let (_tx, rx) = watch::channel(false);
    let res = tokio::time::timeout(Duration::from_secs(10), client.run(rx))
        .await
        .expect("client should stop on a fatal rejection");
    assert_eq!(res, Err(ClientError::AuthFailure));

    let _ = relay_shutdown.send(true);
}

#[tokio::test]
async fn occupied_access_port_is_fatal_for_the_second_client() {
    let (relay_port, registry, relay_shutdown) = start_relay("k1").await;
    let echo_port = start_echo().await;
    let access_port = free_port().await;

    let owner = Client::new(
        client_config("k1", relay_port, echo_port, access_port, 1),
        id(b'a'),
    );
    let (owner_shutdown, owner_rx) = watch::channel(false);
    let owner_task = tokio::spawn(async move { owner.run(owner_rx).await });
    wait_for(
        || registry.context(access_port as u32).is_some(),
        "owner registration",
    )
    .await;

    let intruder = Client::new(
        client_config("k1", relay_port, echo_port, access_port, 1),
        id(b'b'),
    );
    let (_tx, rx) = watch::channel(false);
    let res = tokio::time::timeout(Duration::from_secs(10), intruder.run(rx))
        .await
        .expect("client should stop on a fatal rejection");
    assert_eq!(res, Err(ClientError::PortOccupied(access_port as u32)));

    let _ = owner_shutdown.send(true);
    let _ = relay_shutdown.send(true);
    let _ = owner_task.await;
}
