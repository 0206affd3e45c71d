//! Length-prefixed framing.
//!
//! ```text
//! [u32 native-endian: len][len payload bytes]
//! ```
//!
//! Both ends of a connection live on the same machine, so the prefix uses
//! native byte order. Zero-length frames and frames above
//! [`IpcConfig::MAX_MESSAGE_SIZE`] are protocol errors.

use crate::config::IpcConfig;
use crate::{HostError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn check_size(len: usize) -> Result<()> {
    if len == 0 || len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(HostError::FrameSize {
            size: len,
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Reads frames into a buffer that is reused across frames and only grows
/// when a larger frame arrives.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(IpcConfig::READ_BUFFER_INITIAL),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `None` on clean EOF at a frame boundary. EOF inside a frame is
    /// an error.
    pub async fn next_frame<R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<&[u8]>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_ne_bytes(len_buf) as usize;
        check_size(len)?;

        self.buf.resize(len, 0);
        reader.read_exact(&mut self.buf[..len]).await?;
        Ok(Some(&self.buf[..len]))
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_size(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Validate a payload before it is queued for sending.
pub fn validate_outgoing(payload: &[u8]) -> Result<()> {
    check_size(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();
        write_frame(&mut buf, b"again").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let mut reader = FrameReader::new();
        assert_eq!(
            reader.next_frame(&mut cursor).await.unwrap(),
            Some(&b"hello world"[..])
        );
        assert_eq!(reader.next_frame(&mut cursor).await.unwrap(), Some(&b"again"[..]));
        assert!(reader.next_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new();
        assert!(reader.next_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_zero_length_is_error() {
        let mut cursor = std::io::Cursor::new(0u32.to_ne_bytes().to_vec());
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.next_frame(&mut cursor).await,
            Err(HostError::FrameSize { size: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len = (IpcConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let mut reader = FrameReader::new();
        assert!(reader.next_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_read_truncated_payload_is_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_ne_bytes());
        buf.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(buf);
        let mut reader = FrameReader::new();
        assert!(reader.next_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_write_rejects_empty_and_oversized() {
        let mut sink = Vec::new();
        assert!(write_frame(&mut sink, b"").await.is_err());
        let big = vec![1u8; IpcConfig::MAX_MESSAGE_SIZE + 1];
        assert!(write_frame(&mut sink, &big).await.is_err());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_grows_only_for_larger_frames() {
        let mut buf = Vec::new();
        let large = vec![7u8; IpcConfig::READ_BUFFER_INITIAL * 4];
        write_frame(&mut buf, &large).await.unwrap();
        write_frame(&mut buf, b"tiny").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let mut reader = FrameReader::new();
        reader.next_frame(&mut cursor).await.unwrap();
        let grown = reader.capacity();
        assert!(grown >= large.len());
        reader.next_frame(&mut cursor).await.unwrap();
        assert_eq!(reader.capacity(), grown);
    }
}
