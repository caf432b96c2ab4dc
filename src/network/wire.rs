//! Length-prefixed framing for everything that crosses a connection.
//!
//! Frame format: [4-byte length (u32 big-endian)][payload]
//! Maximum frame size: 4MB plus cipher overhead (prevents memory exhaustion attacks)

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed plaintext message size (4MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Room for two layers of AEAD tags on top of a full message.
pub const MAX_FRAME_SIZE: u32 = (MAX_MESSAGE_SIZE + 64) as u32;

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Frame too large: {} bytes (max: {})", len, MAX_FRAME_SIZE),
        ));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes (max: {})", len, MAX_FRAME_SIZE),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize a message with bincode, enforcing the message size cap.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, String> {
    let payload =
        bincode::serialize(message).map_err(|e| format!("Failed to serialize message: {}", e))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(format!(
            "Message too large: {} bytes (max: {})",
            payload.len(),
            MAX_MESSAGE_SIZE
        ));
    }
    Ok(payload)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    bincode::deserialize(payload).map_err(|e| format!("Failed to deserialize message: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(encode(&big).is_err());
        let small: Vec<u8> = decode(&encode(&vec![1u8, 2, 3]).unwrap()).unwrap();
        assert_eq!(small, vec![1, 2, 3]);
    }
}
