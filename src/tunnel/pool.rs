//! Gateway client pool and per-session loopback tunnels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gateway::{GatewayClient, GatewayDialer};
use super::{resolve_target, TunnelError};
use crate::model::{Asset, Gateway};
use crate::ssh::join_host_port;

const ACCEPT_WATCHDOG: Duration = Duration::from_secs(3);
const REMOTE_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

struct Pooled {
    client: Arc<dyn GatewayClient>,
    count: usize,
    generation: u64,
}

struct Entry {
    gateway_id: u64,
    generation: u64,
    local: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<u64, Pooled>,
    tunnels: HashMap<String, Entry>,
}

/// An opened tunnel: where to connect locally, and how the bridge ended.
pub struct Tunnel {
    pub local: SocketAddr,
    /// Resolves with the bridge's final status.
    pub outcome: oneshot::Receiver<Result<(), TunnelError>>,
}

/// Where a session should connect for its asset.
pub struct Route {
    pub host: String,
    pub port: u16,
    /// The bridge status when the route runs through a gateway tunnel.
    pub outcome: Option<oneshot::Receiver<Result<(), TunnelError>>>,
}

impl Route {
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

pub struct TunnelManager {
    dialer: Arc<dyn GatewayDialer>,
    inner: Arc<Mutex<Inner>>,
    generation: AtomicU64,
}

impl TunnelManager {
    pub fn new(dialer: Arc<dyn GatewayDialer>) -> Self {
        Self {
            dialer,
            inner: Arc::new(Mutex::new(Inner::default())),
            generation: AtomicU64::new(0),
        }
    }

    /// Open a tunnel for `session_id` to `remote_ip:remote_port` through
    /// `gateway`. With `is_connectable` the bridge only proves the remote
    /// end is reachable and then hangs up.
    pub async fn open_tunnel(
        &self,
        is_connectable: bool,
        session_id: &str,
        remote_ip: &str,
        remote_port: u16,
        gateway: &Gateway,
    ) -> Result<Tunnel, TunnelError> {
        // Everything fallible before the pool reference is taken.
        let listener = bind_loopback().await?;
        let local = listener.local_addr()?;

        let mut inner = self.inner.lock().await;

        let (client, generation) = match inner.clients.get_mut(&gateway.id) {
            Some(pooled) => {
                pooled.count += 1;
                (Arc::clone(&pooled.client), pooled.generation)
            }
            None => {
                let client = self.dialer.dial(gateway).await?;
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                info!("Gateway {} ({}) connected", gateway.id, gateway.name);
                inner.clients.insert(
                    gateway.id,
                    Pooled {
                        client: Arc::clone(&client),
                        count: 1,
                        generation,
                    },
                );
                self.spawn_watcher(gateway.id, generation, Arc::clone(&client));
                (client, generation)
            }
        };

        if let Some(old) = inner.tunnels.remove(session_id) {
            warn!("Session {session_id} replaced an open tunnel");
            old.cancel.cancel();
            release(&mut inner, old.gateway_id, old.generation).await;
        }

        let (opened_tx, mut opened_rx) = mpsc::channel(2);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_bridge(
            listener,
            client,
            remote_ip.to_string(),
            remote_port,
            is_connectable,
            cancel.clone(),
            opened_tx,
            outcome_tx,
        ));
        inner.tunnels.insert(
            session_id.to_string(),
            Entry {
                gateway_id: gateway.id,
                generation,
                local,
                cancel,
                task,
            },
        );
        drop(inner);

        match opened_rx.recv().await {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(e),
            None => return Err(TunnelError::Closed),
        }
        debug!("Session {session_id} tunnel {local} -> {remote_ip}:{remote_port} via gateway {}", gateway.id);
        Ok(Tunnel {
            local,
            outcome: outcome_rx,
        })
    }

    /// Tear down the tunnels of `session_ids`, releasing their gateway
    /// references. Unknown ids are ignored.
    pub async fn close_tunnels(&self, session_ids: &[&str]) {
        let mut inner = self.inner.lock().await;
        for sid in session_ids {
            let Some(entry) = inner.tunnels.remove(*sid) else {
                continue;
            };
            entry.cancel.cancel();
            entry.task.abort();
            release(&mut inner, entry.gateway_id, entry.generation).await;
            debug!("Session {sid} tunnel {} closed", entry.local);
        }
    }

    /// Resolve where to connect for `asset`. Without a gateway that is the
    /// asset itself; with one it is the loopback end of a new tunnel, and
    /// the route carries the bridge outcome.
    pub async fn proxy(
        &self,
        is_connectable: bool,
        session_id: &str,
        protocols: &str,
        asset: &Asset,
        gateway: Option<&Gateway>,
    ) -> Result<Route, TunnelError> {
        let (ip, port) = resolve_target(asset, protocols)?;
        let Some(gateway) = gateway.filter(|g| g.id != 0) else {
            return Ok(Route {
                host: ip,
                port,
                outcome: None,
            });
        };
        let tunnel = self
            .open_tunnel(is_connectable, session_id, &ip, port, gateway)
            .await?;
        Ok(Route {
            host: tunnel.local.ip().to_string(),
            port: tunnel.local.port(),
            outcome: Some(tunnel.outcome),
        })
    }

    /// Pool size and reference count for a gateway.
    pub async fn pool_count(&self, gateway_id: u64) -> Option<usize> {
        self.inner.lock().await.clients.get(&gateway_id).map(|p| p.count)
    }

    pub async fn tunnel_addr(&self, session_id: &str) -> Option<SocketAddr> {
        self.inner.lock().await.tunnels.get(session_id).map(|e| e.local)
    }

    /// Close every tunnel and pooled client.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, entry) in inner.tunnels.drain() {
            entry.cancel.cancel();
            entry.task.abort();
        }
        for (id, pooled) in inner.clients.drain() {
            debug!("Closing gateway {id}");
            pooled.client.close().await;
        }
    }

    fn spawn_watcher(&self, gateway_id: u64, generation: u64, client: Arc<dyn GatewayClient>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            client.closed().await;
            let mut inner = inner.lock().await;
            if inner
                .clients
                .get(&gateway_id)
                .is_some_and(|p| p.generation == generation)
            {
                inner.clients.remove(&gateway_id);
                warn!("Gateway {gateway_id} connection lost, evicted from pool");
            }
        });
    }
}

/// Drop one reference; the last one closes and evicts the client.
async fn release(inner: &mut Inner, gateway_id: u64, generation: u64) {
    let Some(pooled) = inner.clients.get_mut(&gateway_id) else {
        return;
    };
    if pooled.generation != generation {
        return;
    }
    pooled.count = pooled.count.saturating_sub(1);
    if pooled.count == 0 {
        if let Some(pooled) = inner.clients.remove(&gateway_id) {
            pooled.client.close().await;
            info!("Gateway {gateway_id} released");
        }
    }
}

/// Take a free loopback port from the kernel, release it and bind the real
/// listener on it.
async fn bind_loopback() -> Result<TcpListener, std::io::Error> {
    let scratch = TcpListener::bind("127.0.0.1:0").await?;
    let addr = scratch.local_addr()?;
    drop(scratch);
    TcpListener::bind(addr).await
}

#[allow(clippy::too_many_arguments)]
async fn run_bridge(
    listener: TcpListener,
    client: Arc<dyn GatewayClient>,
    remote_ip: String,
    remote_port: u16,
    is_connectable: bool,
    cancel: CancellationToken,
    opened: mpsc::Sender<Result<(), TunnelError>>,
    outcome: oneshot::Sender<Result<(), TunnelError>>,
) {
    let _ = opened.send(Ok(())).await;
    let result = bridge(listener, client, &remote_ip, remote_port, is_connectable, &cancel).await;
    if let Err(e) = &result {
        debug!("Tunnel to {remote_ip}:{remote_port} ended: {e}");
    }
    let _ = outcome.send(result);
}

async fn bridge(
    listener: TcpListener,
    client: Arc<dyn GatewayClient>,
    remote_ip: &str,
    remote_port: u16,
    is_connectable: bool,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let mut local: TcpStream = tokio::select! {
        () = cancel.cancelled() => return Err(TunnelError::Closed),
        () = tokio::time::sleep(ACCEPT_WATCHDOG) => {
            return Err(TunnelError::AcceptTimeout(ACCEPT_WATCHDOG));
        }
        accepted = listener.accept() => accepted?.0,
    };
    drop(listener);

    let mut remote = tokio::time::timeout(
        REMOTE_DIAL_TIMEOUT,
        client.open_direct(remote_ip, remote_port),
    )
    .await
    .map_err(|_| TunnelError::RemoteTimeout)??;

    if is_connectable {
        return Ok(());
    }

    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
            copied?;
            Ok(())
        }
    }
}
