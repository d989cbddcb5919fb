//! Pull server
//!
//! Accepts sync connections from peer clusters and answers every
//! `PullRequest` with the local registry snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::SyncMessage;
use super::transport::{self, Keyfile, TransportError};
use crate::lifecycle::{Lifecycle, Module, TaskPool};
use crate::registry::RegistrySource;

pub struct SyncServer {
    lifecycle: Lifecycle,
    bind_addr: String,
    keyfile: Option<Arc<Keyfile>>,
    registry: Arc<dyn RegistrySource>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl SyncServer {
    pub fn new(
        bind_addr: impl Into<String>,
        keyfile: Option<Arc<Keyfile>>,
        registry: Arc<dyn RegistrySource>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("rpc"),
            bind_addr: bind_addr.into(),
            keyfile,
            registry,
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Address actually bound, once ready
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, pool: TaskPool) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Sync connection from {}", peer);
                    let server = self.clone();
                    pool.spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            match e {
                                TransportError::Disconnected => {
                                    debug!("Sync peer {} disconnected", peer)
                                }
                                e => warn!("Sync connection from {} failed: {}", peer, e),
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept sync connection: {}", e);
                }
            }
        }
        debug!("Sync server accept loop exited");
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), TransportError> {
        stream.set_nodelay(true)?;

        let handshake = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            handshake = tokio::time::timeout(
                transport::HANDSHAKE_TIMEOUT,
                transport::server_handshake(&mut stream, self.keyfile.as_deref()),
            ) => handshake,
        };
        match handshake {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::AuthFailed("Handshake timed out".to_string()));
            }
        }

        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                msg = transport::read_message(&mut stream) => msg?,
            };

            let reply = match msg {
                SyncMessage::PullRequest => match self.registry.snapshot().await {
                    Ok(snapshot) => {
                        debug!(
                            "Serving snapshot: {} services, {} instances",
                            snapshot.services.len(),
                            snapshot.instances.len()
                        );
                        SyncMessage::PullResponse { snapshot }
                    }
                    Err(e) => {
                        warn!("Failed to read local registry: {}", e);
                        SyncMessage::Error {
                            message: e.to_string(),
                        }
                    }
                },
                other => SyncMessage::Error {
                    message: format!("Unsupported request {}", other.kind()),
                },
            };
            transport::write_message(&mut stream, &reply).await?;
        }
    }
}

#[async_trait]
impl Module for SyncServer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(self: Arc<Self>, pool: &TaskPool) {
        if !self.lifecycle.mark_starting() {
            return;
        }
        let task_pool = pool.clone();
        pool.spawn(async move {
            let listener = match TcpListener::bind(&self.bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.lifecycle
                        .fail(format!("failed to bind {}: {}", self.bind_addr, e));
                    return;
                }
            };
            let local = listener.local_addr().ok();
            *self.local_addr.lock() = local;
            info!("Sync server listening on {}", self.bind_addr);
            self.lifecycle.mark_ready();

            self.accept_loop(listener, task_pool).await;
        });
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if self.lifecycle.mark_stopped() {
            info!("Sync server stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::model::{InstanceRecord, ServiceRecord, Snapshot};
    use crate::registry::MemoryRegistry;
    use crate::sync::client::SyncClient;
    use std::time::Duration;

    async fn started_server(
        registry: Arc<MemoryRegistry>,
        keyfile: Option<Arc<Keyfile>>,
    ) -> (Arc<SyncServer>, TaskPool) {
        let pool = TaskPool::new();
        let server = Arc::new(SyncServer::new("127.0.0.1:0", keyfile, registry));
        server.clone().start(&pool);
        server.ready().await.unwrap();
        (server, pool)
    }

    #[tokio::test]
    async fn test_pull_returns_registry_snapshot() {
        let registry = Arc::new(MemoryRegistry::new(Snapshot::new(
            vec![ServiceRecord::new("s1")],
            vec![InstanceRecord::new("i1", "s1")],
        )));
        let (server, pool) = started_server(registry.clone(), None).await;
        let addr = server.local_addr().unwrap().to_string();

        let client = SyncClient::connect(&addr, None, Duration::from_secs(5))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let snapshot = client.pull(&cancel).await.unwrap();
        assert_eq!(snapshot.instances[0].instance_id, "i1");

        // Same connection sees later registry changes
        registry.upsert_instance(InstanceRecord::new("i2", "s1"));
        let snapshot = client.pull(&cancel).await.unwrap();
        assert_eq!(snapshot.instances.len(), 2);

        server.stop().await;
        pool.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_pull_with_keyfile() {
        let key = Arc::new(Keyfile::new("shared-secret"));
        let registry = Arc::new(MemoryRegistry::default());
        let (server, pool) = started_server(registry, Some(key.clone())).await;
        let addr = server.local_addr().unwrap().to_string();

        let client = SyncClient::connect(&addr, Some(key), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.pull(&CancellationToken::new()).await.unwrap().is_empty());

        let wrong = Arc::new(Keyfile::new("other"));
        let err = SyncClient::connect(&addr, Some(wrong), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed(_)));

        server.stop().await;
        pool.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_bind_failure_reports_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let pool = TaskPool::new();
        let server = Arc::new(SyncServer::new(
            addr,
            None,
            Arc::new(MemoryRegistry::default()),
        ));
        server.clone().start(&pool);

        let err = server.ready().await.unwrap_err();
        assert!(matches!(err, SyncError::ModuleFailed { .. }));
        pool.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_stop_with_idle_connection() {
        let (server, pool) = started_server(Arc::new(MemoryRegistry::default()), None).await;
        // Never sends the magic header
        let _idle = tokio::net::TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await;
        let drained = tokio::time::timeout(Duration::from_secs(5), pool.close_and_wait()).await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (server, pool) = started_server(Arc::new(MemoryRegistry::default()), None).await;
        server.stop().await;
        server.stop().await;
        assert!(server.lifecycle().is_stopped());
        assert!(server.error().await.is_none());
        pool.close_and_wait().await;
    }
}
