//! Pull client and per-address client pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::SyncMessage;
use super::transport::{self, Keyfile, TransportError};
use crate::error::{SyncError, SyncResult};
use crate::model::Snapshot;

/// Client for one peer's sync server. Holds at most one connection; a
/// connection that saw any error is dropped and the next pull redials.
pub struct SyncClient {
    addr: String,
    keyfile: Option<Arc<Keyfile>>,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl SyncClient {
    /// Dials `addr` and completes the handshake.
    pub async fn connect(
        addr: &str,
        keyfile: Option<Arc<Keyfile>>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = Self::dial(addr, keyfile.as_deref(), timeout).await?;
        Ok(Self {
            addr: addr.to_string(),
            keyfile,
            timeout,
            conn: Mutex::new(Some(stream)),
        })
    }

    async fn dial(
        addr: &str,
        keyfile: Option<&Keyfile>,
        timeout: Duration,
    ) -> Result<TcpStream, TransportError> {
        debug!("SyncClient: connecting to {}", addr);
        let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!("{}: {}", addr, e)))
            }
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{}: connect timed out",
                    addr
                )))
            }
        };
        stream.set_nodelay(true)?;

        match tokio::time::timeout(
            transport::HANDSHAKE_TIMEOUT,
            transport::client_handshake(&mut stream, keyfile),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{}: handshake timed out",
                    addr
                )))
            }
        }
        debug!("SyncClient: connected to {}", addr);
        Ok(stream)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Pulls the peer's full snapshot. Bounded by the client timeout and by
    /// `cancel`; neither leaves a half-read connection behind.
    pub async fn pull(&self, cancel: &CancellationToken) -> SyncResult<Snapshot> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.pull_inner()) => match result {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!("pull from {}", self.addr))),
            },
        }
    }

    async fn pull_inner(&self) -> SyncResult<Snapshot> {
        let mut slot = self.conn.lock().await;
        // Taken out so an interrupted exchange drops the stream.
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => Self::dial(&self.addr, self.keyfile.as_deref(), self.timeout).await?,
        };

        transport::write_message(&mut stream, &SyncMessage::PullRequest).await?;
        let reply = transport::read_message(&mut stream).await?;
        *slot = Some(stream);

        match reply {
            SyncMessage::PullResponse { snapshot } => Ok(snapshot),
            SyncMessage::Error { message } => Err(SyncError::Remote(message)),
            other => Err(TransportError::UnexpectedMessage(other.kind().to_string()).into()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Caches one client per peer address.
///
/// Two concurrent misses for the same address may both dial; the first
/// client inserted is kept and handed to every caller, the other is
/// dropped.
pub struct ClientPool {
    clients: RwLock<HashMap<String, Arc<SyncClient>>>,
    keyfile: Option<Arc<Keyfile>>,
    timeout: Duration,
}

impl ClientPool {
    pub fn new(keyfile: Option<Arc<Keyfile>>, timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            keyfile,
            timeout,
        }
    }

    pub async fn get_client(&self, addr: &str) -> Result<Arc<SyncClient>, TransportError> {
        let cached = self.clients.read().get(addr).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = Arc::new(SyncClient::connect(addr, self.keyfile.clone(), self.timeout).await?);

        let mut clients = self.clients.write();
        let stored = clients.entry(addr.to_string()).or_insert(client);
        Ok(stored.clone())
    }

    /// Drops the cached client for `addr`
    pub fn remove(&self, addr: &str) -> bool {
        let removed = self.clients.write().remove(addr).is_some();
        if removed {
            debug!("ClientPool: dropped client for {}", addr);
        }
        removed
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.clients.read().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.clients.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_concurrent_get_client_keeps_one_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Keep accepted sockets open for the duration of the test
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let pool = Arc::new(ClientPool::new(None, Duration::from_secs(5)));
        let (a, b) = tokio::join!(pool.get_client(&addr), pool.get_client(&addr));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&a, &b));

        let again = pool.get_client(&addr).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(pool.addresses(), vec![addr]);
    }

    #[tokio::test]
    async fn test_dial_failure_is_not_cached() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = ClientPool::new(None, Duration::from_secs(2));
        let err = pool.get_client(&addr).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_remove_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = ClientPool::new(None, Duration::from_secs(2));
        pool.get_client(&addr).await.unwrap();
        assert!(pool.contains(&addr));

        assert!(pool.remove(&addr));
        assert!(!pool.remove(&addr));
        assert!(pool.is_empty());
        drop(listener);
    }

    #[tokio::test]
    async fn test_pull_honors_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts but never answers
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = SyncClient::connect(&addr, None, Duration::from_secs(30))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client.pull(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        // The interrupted connection was discarded
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_pull_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = SyncClient::connect(&addr, None, Duration::from_millis(100))
            .await
            .unwrap();
        let err = client.pull(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }
}
