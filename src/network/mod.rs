// # Node Networking
//
// TCP transport for the node protocol: length-prefixed bincode frames, a
// server exposing a shard group node, and the client connection with
// transient-error retry.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RemoteNodeClient, TcpShardConnector};
pub use server::NodeServer;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{AccessError, Result};
use protocol::MAX_FRAME_SIZE;

/// Write one length-prefixed frame.
pub(crate) async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(AccessError::Network(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| AccessError::Network(e.to_string()))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| AccessError::Network(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 4];
    match stream.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(AccessError::Network(e.to_string())),
    }
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(AccessError::Network(format!(
            "peer announced a frame of {} bytes, above the {} byte limit",
            length, MAX_FRAME_SIZE
        )));
    }
    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| AccessError::Network(e.to_string()))?;
    Ok(Some(payload))
}
