//! TCP framing and authentication for sync connections
//!
//! Frame layout: `[compressed: u8][length: u32 BE][bincode payload]`, with
//! LZ4 applied to payloads above [`COMPRESSION_THRESHOLD`]. When both sides
//! share a keyfile the server challenges the client with a random nonce
//! that must come back signed with HMAC-SHA256.

use std::path::Path;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::protocol::{SyncMessage, MAGIC_HEADER};

/// Maximum frame size (64 MB); snapshots are full-state transfers
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Compression threshold (64 KB)
pub const COMPRESSION_THRESHOLD: usize = 64 * 1024;

/// Upper bound for the connection handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Disconnected")]
    Disconnected,
}

/// Shared secret used to sign handshake challenges.
pub struct Keyfile {
    key: Vec<u8>,
}

impl Keyfile {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let content = std::fs::read(path).map_err(|e| {
            TransportError::AuthFailed(format!("Failed to read keyfile {}: {}", path.display(), e))
        })?;
        let key = content.trim_ascii().to_vec();
        if key.is_empty() {
            return Err(TransportError::AuthFailed(format!(
                "Keyfile {} is empty",
                path.display()
            )));
        }
        debug!("Loaded keyfile from {}", path.display());
        Ok(Self { key })
    }

    fn mac(&self) -> Result<Hmac<Sha256>, TransportError> {
        Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| TransportError::AuthFailed(format!("Invalid key: {}", e)))
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.mac() {
            Ok(mut mac) => {
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for Keyfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyfile").finish_non_exhaustive()
    }
}

/// Write a message to a stream
pub async fn write_message<T>(stream: &mut T, msg: &SyncMessage) -> Result<(), TransportError>
where
    T: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg).map_err(|e| TransportError::EncodeError(e.to_string()))?;

    let (data, compressed) = if payload.len() > COMPRESSION_THRESHOLD {
        (lz4_flex::compress_prepend_size(&payload), true)
    } else {
        (payload, false)
    };

    let len = u32::try_from(data.len()).map_err(|_| TransportError::MessageTooLarge(u32::MAX))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    let mut header = [0u8; 5];
    header[0] = u8::from(compressed);
    header[1..5].copy_from_slice(&len.to_be_bytes());

    stream.write_all(&header).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;

    Ok(())
}

/// Read a message from a stream
pub async fn read_message<T>(stream: &mut T) -> Result<SyncMessage, TransportError>
where
    T: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Disconnected)
        }
        Err(e) => return Err(e.into()),
    }

    let compressed = header[0] == 1;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    let payload = if compressed {
        lz4_flex::decompress_size_prepended(&data)
            .map_err(|e| TransportError::DecodeError(format!("Decompression failed: {}", e)))?
    } else {
        data
    };

    bincode::deserialize(&payload).map_err(|e| TransportError::DecodeError(e.to_string()))
}

/// Client side of the handshake: magic header, then answer the challenge
/// if the server sends one.
pub async fn client_handshake<T>(stream: &mut T, keyfile: Option<&Keyfile>) -> Result<(), TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(MAGIC_HEADER).await?;
    stream.flush().await?;

    let Some(keyfile) = keyfile else {
        return Ok(());
    };

    let challenge = match read_message(stream).await? {
        SyncMessage::AuthChallenge { challenge } => challenge,
        other => {
            return Err(TransportError::AuthFailed(format!(
                "Expected AuthChallenge, got {}",
                other.kind()
            )))
        }
    };

    let hmac = keyfile.sign(&challenge)?;
    write_message(stream, &SyncMessage::AuthResponse { hmac }).await?;

    match read_message(stream).await? {
        SyncMessage::AuthResult { success: true, .. } => Ok(()),
        SyncMessage::AuthResult { message, .. } => Err(TransportError::AuthFailed(message)),
        other => Err(TransportError::AuthFailed(format!(
            "Unexpected response {}",
            other.kind()
        ))),
    }
}

/// Server side of the handshake.
pub async fn server_handshake<T>(stream: &mut T, keyfile: Option<&Keyfile>) -> Result<(), TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; MAGIC_HEADER.len()];
    stream.read_exact(&mut magic).await?;
    if &magic != MAGIC_HEADER {
        return Err(TransportError::AuthFailed("Invalid protocol header".to_string()));
    }

    let Some(keyfile) = keyfile else {
        return Ok(());
    };

    use rand::Rng;
    let challenge: Vec<u8> = rand::thread_rng().gen::<[u8; 32]>().to_vec();
    write_message(
        stream,
        &SyncMessage::AuthChallenge {
            challenge: challenge.clone(),
        },
    )
    .await?;

    let client_hmac = match read_message(stream).await? {
        SyncMessage::AuthResponse { hmac } => hmac,
        other => {
            let _ = write_message(
                stream,
                &SyncMessage::AuthResult {
                    success: false,
                    message: "Expected AuthResponse".to_string(),
                },
            )
            .await;
            return Err(TransportError::AuthFailed(format!(
                "Expected AuthResponse, got {}",
                other.kind()
            )));
        }
    };

    let success = keyfile.verify(&challenge, &client_hmac);
    let message = if success { "OK" } else { "Invalid HMAC" };
    write_message(
        stream,
        &SyncMessage::AuthResult {
            success,
            message: message.to_string(),
        },
    )
    .await?;

    if success {
        Ok(())
    } else {
        Err(TransportError::AuthFailed(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceRecord, Snapshot};

    #[tokio::test]
    async fn test_write_read_small_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_message(&mut client, &SyncMessage::PullRequest).await.unwrap();
        let msg = read_message(&mut server).await.unwrap();
        assert!(matches!(msg, SyncMessage::PullRequest));
    }

    #[tokio::test]
    async fn test_large_message_is_compressed() {
        let instances = (0..5000)
            .map(|i| InstanceRecord::new(format!("instance-{}", i), "svc"))
            .collect();
        let msg = SyncMessage::PullResponse {
            snapshot: Snapshot::new(Vec::new(), instances),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        assert_eq!(buf[0], 1, "compressed flag should be set");

        let mut reader = buf.as_slice();
        match read_message(&mut reader).await.unwrap() {
            SyncMessage::PullResponse { snapshot } => assert_eq!(snapshot.instances.len(), 5000),
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut frame = vec![0u8];
        frame.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        let mut reader = frame.as_slice();

        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge(_)));
    }

    #[tokio::test]
    async fn test_eof_reads_as_disconnected() {
        let mut reader: &[u8] = &[];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_handshake_with_shared_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let client_key = Keyfile::new("secret");
        let server_key = Keyfile::new("secret");

        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, Some(&server_key)).await });
        client_handshake(&mut client, Some(&client_key)).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let client_key = Keyfile::new("guess");
        let server_key = Keyfile::new("secret");

        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, Some(&server_key)).await });
        let client_result = client_handshake(&mut client, Some(&client_key)).await;

        assert!(matches!(client_result, Err(TransportError::AuthFailed(_))));
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"http/1.1 ").await.unwrap();

        let err = server_handshake(&mut server, None).await.unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed(_)));
    }
}
