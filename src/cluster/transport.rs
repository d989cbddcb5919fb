use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::node::Member;

/// Gossip frames are small; anything bigger is a protocol error
const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Message types for gossip membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Join { member: Member },
    Gossip { from: String, members: Vec<Member> },
    Members { members: Vec<Member> },
    Leave { member: Member },
    Ack,
}

pub async fn write_frame<T>(stream: &mut T, msg: &GossipMessage) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let data = serde_json::to_vec(msg)?;
    let len = u32::try_from(data.len()).context("gossip frame too large")?;
    if len > MAX_FRAME_SIZE {
        bail!("gossip frame too large: {} bytes", len);
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T>(stream: &mut T) -> Result<GossipMessage>
where
    T: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_SIZE {
        bail!("gossip frame too large: {} bytes", len);
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Sends one message on a fresh connection and waits for the reply
pub async fn exchange(addr: &str, msg: &GossipMessage, timeout: Duration) -> Result<GossipMessage> {
    let work = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;
        write_frame(&mut stream, msg).await?;
        read_frame(&mut stream).await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => bail!("gossip exchange with {} timed out", addr),
    }
}
