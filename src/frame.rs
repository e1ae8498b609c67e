//! # Message Framing
//!
//! Wire format of every message:
//!
//! ```text
//! +----------------------+-------------------+
//! | Length (u32, BE)     | Payload           |
//! | 4 bytes              | `Length` bytes    |
//! +----------------------+-------------------+
//! ```
//!
//! There is no version field and no type tag: what a frame means depends on
//! its position in the conversation. The length always describes the bytes
//! actually on the wire, i.e. after any encryption.
//!
//! Writes and reads are explicit loops over partial I/O so that a stream
//! which moves one byte per call still carries whole frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, NetworkResult};

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a receiver will buffer (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a payload length as the 4-byte prefix
pub fn encode_length(len: usize) -> NetworkResult<[u8; LENGTH_PREFIX_SIZE]> {
    let len = u32::try_from(len).map_err(|_| NetworkError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    Ok(len.to_be_bytes())
}

/// Decode the 4-byte prefix
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> usize {
    u32::from_be_bytes(prefix) as usize
}

/// Write one frame: prefix, then payload
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    let prefix = encode_length(payload.len())?;
    write_fully(writer, &prefix).await?;
    write_fully(writer, payload).await?;
    writer
        .flush()
        .await
        .map_err(|_| NetworkError::UnexpectedClose)
}

/// Read one frame and return its payload
pub async fn read_frame<R>(reader: &mut R) -> NetworkResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_fully(reader, &mut prefix).await?;

    let len = decode_length(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_fully(reader, &mut payload).await?;
    Ok(payload)
}

/// Keep writing until every byte is accepted
///
/// A write that accepts nothing, or fails, means the peer is gone.
async fn write_fully<W>(writer: &mut W, data: &[u8]) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < data.len() {
        match writer.write(&data[sent..]).await {
            Ok(0) | Err(_) => return Err(NetworkError::UnexpectedClose),
            Ok(n) => sent += n,
        }
    }
    Ok(())
}

/// Keep reading until `buf` is full
async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> NetworkResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    while received < buf.len() {
        match reader.read(&mut buf[received..]).await? {
            0 => return Err(NetworkError::ClosedConnection),
            n => received += n,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix_is_network_order() {
        assert_eq!(encode_length(0x0102_0304).unwrap(), [1, 2, 3, 4]);
        assert_eq!(decode_length([0, 0, 1, 0]), 256);
    }

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, b"third message").await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert!(read_frame(&mut b).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut b).await.unwrap(), b"third message");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_one_byte_per_call() {
        // A duplex buffer of one byte forces every read and write to move a
        // single byte.
        let (mut a, mut b) = tokio::io::duplex(1);
        let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap(), expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetworkError::ClosedConnection)
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 100]).await.unwrap();
        a.write_all(&[7; 10]).await.unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetworkError::ClosedConnection)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetworkError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer() {
        let (mut a, b) = tokio::io::duplex(64);
        drop(b);

        assert!(matches!(
            write_frame(&mut a, b"nobody listening").await,
            Err(NetworkError::UnexpectedClose)
        ));
    }
}
