use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Instant,
};

use dashmap::DashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Notify, watch},
};

use crate::pierce::{
    auth,
    config::ServerConfig,
    net,
    tunnel::protocol::{self, Code, Message, PROTOCOL_VERSION},
};

/// Upper bound on pooled tunnel connections per access port; also the
/// largest configurable client-side `tunnel_count`.
pub const POOL_CAPACITY: usize = 5;

/// One live, authenticated tunnel connection waiting to be matched to a
/// visitor.
pub struct TunnelConn {
    pub stream: TcpStream,
    pub created: Instant,
}

impl TunnelConn {
    fn new(stream: TcpStream) -> Self {
        TunnelConn {
            stream,
            created: Instant::now(),
        }
    }
}

/// Bounded FIFO of ready tunnel connections.
///
/// `take` and `push` block on empty/full (backpressure, not failure); the
/// heartbeat sweep drains a length snapshot instead so it can never block
/// behind its own re-enqueues.
struct Pool {
    queue: Mutex<VecDeque<TunnelConn>>,
    capacity: usize,
    added: Notify,
    removed: Notify,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Pool {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            added: Notify::new(),
            removed: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("pool lock").len()
    }

    async fn push(&self, conn: TunnelConn) {
        let mut conn = conn;
        loop {
            match self.try_push(conn) {
                Ok(()) => return,
                Err(back) => {
                    conn = back;
                    self.removed.notified().await;
                }
            }
        }
    }

    fn try_push(&self, conn: TunnelConn) -> Result<(), TunnelConn> {
        let mut q = self.queue.lock().expect("pool lock");
        if q.len() >= self.capacity {
            return Err(conn);
        }
        q.push_back(conn);
        drop(q);
        self.added.notify_one();
        Ok(())
    }

    async fn take(&self) -> TunnelConn {
        loop {
            if let Some(conn) = self.try_take() {
                return conn;
            }
            self.added.notified().await;
        }
    }

    fn try_take(&self) -> Option<TunnelConn> {
        let conn = self.queue.lock().expect("pool lock").pop_front();
        if conn.is_some() {
            self.removed.notify_one();
        }
        conn
    }

    /// Remove everything queued at the moment of the call. Connections
    /// pushed concurrently stay queued for the next drain.
    fn drain_snapshot(&self) -> Vec<TunnelConn> {
        let drained: Vec<_> = {
            let mut q = self.queue.lock().expect("pool lock");
            q.drain(..).collect()
        };
        for _ in &drained {
            self.removed.notify_one();
        }
        drained
    }
}

/// Server-side state for one registered access port: the owning
/// registration, its connection pool, and the close signal for the
/// visitor-accept task.
pub struct TunnelContext {
    request: Message,
    pool: Pool,
    created: Instant,
    closed: watch::Sender<bool>,
}

impl TunnelContext {
    fn new(request: Message) -> Self {
        let (closed, _) = watch::channel(false);
        TunnelContext {
            request,
            pool: Pool::new(POOL_CAPACITY),
            created: Instant::now(),
            closed,
        }
    }

    pub fn access_port(&self) -> u32 {
        self.request.access_port
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Probe every pooled connection present at sweep start with a
    /// heartbeat; re-enqueue those that accept it, discard the rest.
    /// Returns whether the pool still holds a live connection.
    async fn heartbeat(&self) -> bool {
        for mut conn in self.pool.drain_snapshot() {
            let probe = self.request.reply(Code::HeartBeat);
            if protocol::send(&mut conn.stream, &probe).await.is_ok() {
                self.pool.push(conn).await;
            } else {
                tracing::debug!(
                    port = self.request.access_port,
                    age = ?conn.created.elapsed(),
                    "heartbeat: evicting dead tunnel connection"
                );
            }
        }
        self.pool.len() > 0
    }
}

/// Per-port tunnel registry owned by one relay process.
///
/// Lookups go through the concurrent map lock-free; context creation for a
/// port is linearized by `create_lock` so concurrent first registrations
/// cannot bind duplicate listeners.
pub struct Registry {
    config: ServerConfig,
    contexts: DashMap<u32, Arc<TunnelContext>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Registry {
            config,
            contexts: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self, access_port: u32) -> Option<Arc<TunnelContext>> {
        self.contexts.get(&access_port).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Handle one freshly accepted tunnel connection: receive its
    /// registration, validate it, and either pool it under its access
    /// port's context or reject and close it.
    pub async fn handle_tunnel_connection(self: &Arc<Self>, mut conn: TcpStream) {
        let peer = conn
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let req = protocol::receive(&mut conn).await;
        if req.code == Code::ReceiveFailure {
            // Nothing readable arrived; the connection is not worth a reply.
            tracing::debug!(peer = %peer, "registry: dropped unreadable tunnel request");
            return;
        }

        if let Some(code) = self.check_request(&req) {
            tracing::warn!(peer = %peer, code = ?code, request = %req, "registry: rejected tunnel request");
            let _ = protocol::send(&mut conn, &req.reply(code)).await;
            return;
        }

        // Common case: the port is already registered.
        if let Some(ctx) = self.context(req.access_port) {
            self.admit(&ctx, req, conn).await;
            return;
        }

        // First registration for this port. Re-check under the create lock
        // so concurrent first-arrivals cannot both bind a listener.
        let guard = self.create_lock.lock().await;
        if let Some(ctx) = self.context(req.access_port) {
            drop(guard);
            self.admit(&ctx, req, conn).await;
            return;
        }

        let port = req.access_port;
        let Some(listener) = net::listen(port as u16).await else {
            drop(guard);
            tracing::warn!(peer = %peer, port, "registry: public bind failed, rejecting registration");
            let _ = protocol::send(&mut conn, &req.reply(Code::Fail)).await;
            return;
        };

        let ctx = Arc::new(TunnelContext::new(req));
        self.contexts.insert(port, ctx.clone());
        drop(guard);

        tracing::info!(peer = %peer, port, client = %ctx.request.client_id, "registry: registered access port");

        let registry = self.clone();
        let serve_ctx = ctx.clone();
        tokio::spawn(async move {
            registry.serve_access(serve_ctx, listener).await;
        });

        ctx.pool.push(TunnelConn::new(conn)).await;
    }

    /// Validate a registration in order: sentinel, version, key, port
    /// range. `None` means acceptable; `Some(code)` is the rejection to
    /// send back.
    fn check_request(&self, req: &Message) -> Option<Code> {
        if req.code != Code::Success {
            return Some(Code::Fail);
        }
        if req.version != PROTOCOL_VERSION {
            return Some(Code::VersionMismatch);
        }
        if !auth::check_key(&self.config.key, &req.key) {
            return Some(Code::AuthFailure);
        }
        if !self.config.port_in_range(req.access_port) {
            return Some(Code::IllegalAccessPort);
        }
        None
    }

    /// Admit a validated connection to an existing context, or reject it
    /// when the port is owned by a different client.
    async fn admit(&self, ctx: &Arc<TunnelContext>, req: Message, mut conn: TcpStream) {
        if ctx.request.is_same_client(&req) {
            ctx.pool.push(TunnelConn::new(conn)).await;
        } else {
            tracing::warn!(
                port = req.access_port,
                owner = %ctx.request.client_id,
                client = %req.client_id,
                "registry: access port already owned by another client"
            );
            let _ = protocol::send(&mut conn, &req.reply(Code::PortOccupied)).await;
        }
    }

    /// Accept visitors on a context's public listener for its lifetime.
    ///
    /// Each visitor is matched with one pooled tunnel connection; the
    /// signal send doubles as a liveness check. The loop ends when the
    /// context is closed, the listener errors, or a handoff send fails,
    /// and always removes the context on exit.
    async fn serve_access(self: Arc<Self>, ctx: Arc<TunnelContext>, listener: TcpListener) {
        let port = ctx.access_port();
        let mut closed = ctx.close_signal();

        loop {
            if *closed.borrow() {
                break;
            }

            let visitor = tokio::select! {
                _ = closed.changed() => continue,
                res = listener.accept() => match res {
                    Ok((visitor, addr)) => {
                        tracing::debug!(port, visitor = %addr, "registry: visitor connected");
                        visitor
                    }
                    Err(err) => {
                        tracing::warn!(port, err = %err, "registry: public listener failed");
                        break;
                    }
                },
            };

            // Backpressure: wait for a pooled tunnel when empty, but give
            // up if the context is closed in the meantime.
            let mut tunnel = tokio::select! {
                _ = closed.changed() => continue,
                tunnel = ctx.pool.take() => tunnel,
            };

            if protocol::send(&mut tunnel.stream, &ctx.request).await.is_ok() {
                tokio::spawn(net::forward(tunnel.stream, visitor));
            } else {
                tracing::warn!(port, "registry: dead tunnel on handoff, retiring access port");
                break;
            }
        }

        self.remove(port);
    }

    fn remove(&self, access_port: u32) {
        if let Some((_, ctx)) = self.contexts.remove(&access_port) {
            ctx.close();
            tracing::info!(port = access_port, "registry: removed tunnel context");
        }
    }

    /// Probe every live context; retire those whose pool is empty
    /// afterwards (pool existence is the liveness signal).
    pub async fn heartbeat_sweep(&self) {
        let snapshot: Vec<(u32, Arc<TunnelContext>)> = self
            .contexts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (port, ctx) in snapshot {
            if !ctx.heartbeat().await {
                tracing::info!(
                    port,
                    age = ?ctx.age(),
                    "registry: heartbeat found empty pool, retiring access port"
                );
                ctx.close();
                self.contexts.remove(&port);
            }
        }
    }

    /// Drive heartbeat sweeps until shutdown.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(protocol::HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.heartbeat_sweep().await,
            }
        }
    }

    /// Close every context; their accept tasks observe the signal and
    /// remove themselves.
    pub fn shutdown(&self) {
        for entry in self.contexts.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pierce::tunnel::protocol::{CLIENT_ID_LEN, ClientId};

    fn test_config() -> ServerConfig {
        ServerConfig::new("k1", 7000, 1024, 65535).expect("config")
    }

    fn id(fill: u8) -> ClientId {
        ClientId::from([fill; CLIENT_ID_LEN])
    }

    async fn free_port() -> u32 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        u32::from(ln.local_addr().unwrap().port())
    }

    async fn register(registry: &Arc<Registry>, port: u32, client: ClientId, key: &str) -> TcpStream {
        // Loop the registration through a real socket pair so the registry
        // sees a TcpStream like in production.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });
        let mut client_side = TcpStream::connect(addr).await.unwrap();
        let server_side = accept.await.unwrap();

        protocol::send(&mut client_side, &Message::request(port, client, key))
            .await
            .unwrap();
        registry.handle_tunnel_connection(server_side).await;
        client_side
    }

    #[tokio::test]
    async fn rejects_in_validation_order() {
        let registry = Registry::new(test_config());

        let bad_version = Message {
            version: PROTOCOL_VERSION - 1,
            ..Message::request(15000, id(b'a'), "k1")
        };
        assert_eq!(registry.check_request(&bad_version), Some(Code::VersionMismatch));

        let bad_key = Message::request(15000, id(b'a'), "wrong");
        assert_eq!(registry.check_request(&bad_key), Some(Code::AuthFailure));

        // Range is exclusive of both bounds.
        for port in [1024, 65535, 80] {
            let out_of_range = Message::request(port, id(b'a'), "k1");
            assert_eq!(
                registry.check_request(&out_of_range),
                Some(Code::IllegalAccessPort)
            );
        }

        let sentinel = Message::request(15000, id(b'a'), "k1").reply(Code::ReceiveFailure);
        assert_eq!(registry.check_request(&sentinel), Some(Code::Fail));

        let ok = Message::request(15000, id(b'a'), "k1");
        assert_eq!(registry.check_request(&ok), None);
    }

    #[tokio::test]
    async fn concurrent_first_registrations_create_one_context() {
        let registry = Registry::new(test_config());
        let port = free_port().await;

        let mut holds = Vec::new();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let registry = registry.clone();
            tasks.spawn(async move { register(&registry, port, id(b'a'), "k1").await });
        }
        while let Some(res) = tasks.join_next().await {
            holds.push(res.unwrap());
        }

        assert_eq!(registry.len(), 1);
        let ctx = registry.context(port).expect("context");
        assert_eq!(ctx.pool_len(), 4);
    }

    #[tokio::test]
    async fn different_identity_gets_port_occupied() {
        let registry = Registry::new(test_config());
        let port = free_port().await;

        let _owner = register(&registry, port, id(b'a'), "k1").await;
        let ctx = registry.context(port).expect("context");
        assert_eq!(ctx.pool_len(), 1);

        let mut intruder = register(&registry, port, id(b'b'), "k1").await;
        let resp = protocol::receive(&mut intruder).await;
        assert_eq!(resp.code, Code::PortOccupied);

        // The owner's pool is untouched.
        assert_eq!(ctx.pool_len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_evicts_dead_connections_and_retires_empty_contexts() {
        let registry = Registry::new(test_config());
        let port = free_port().await;

        let live = register(&registry, port, id(b'a'), "k1").await;
        let dead = register(&registry, port, id(b'a'), "k1").await;
        let ctx = registry.context(port).unwrap();
        assert_eq!(ctx.pool_len(), 2);

        drop(dead);
        // A write after the peer closed may still land in the kernel
        // buffer; the failure surfaces on a later write, so sweep until
        // the eviction shows up.
        let mut evicted = false;
        for _ in 0..5 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            registry.heartbeat_sweep().await;
            if registry.context(port).is_some_and(|c| c.pool_len() == 1) {
                evicted = true;
                break;
            }
        }
        assert!(evicted, "dead connection was never evicted");
        assert!(ctx.age() >= std::time::Duration::from_millis(50));

        drop(live);
        let mut retired = false;
        for _ in 0..5 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            registry.heartbeat_sweep().await;
            if registry.context(port).is_none() {
                retired = true;
                break;
            }
        }
        assert!(retired, "empty context was never retired");
        assert!(registry.is_empty());

        // The public listener was dropped with the accept task; the port
        // can be bound again.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(net::listen(port as u16).await.is_some());
    }

    #[tokio::test]
    async fn pool_push_take_backpressure() {
        let pool = Arc::new(Pool::new(2));

        // take blocks on an empty pool until a push arrives.
        let taker = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!taker.is_finished());

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(ln.accept().await.unwrap().0);
            }
            out
        });
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        let mut streams = accept.await.unwrap();

        pool.push(TunnelConn::new(streams.remove(0))).await;
        taker.await.unwrap();

        // Fill to capacity, then verify a further push blocks until a
        // take frees a slot.
        pool.push(TunnelConn::new(streams.remove(0))).await;
        pool.push(TunnelConn::new(streams.remove(0))).await;
        assert_eq!(pool.len(), 2);

        let blocked = {
            let pool = pool.clone();
            let extra = streams.remove(0);
            tokio::spawn(async move { pool.push(TunnelConn::new(extra)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        pool.take().await;
        blocked.await.unwrap();
        assert_eq!(pool.len(), 2);
    }
}
