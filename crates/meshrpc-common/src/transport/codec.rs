use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{MeshError, Result};
use crate::protocol::Frames;

/// Maximum message body size (16 MB).
///
/// Prevents a misbehaving peer from forcing arbitrarily large allocations.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Writes one multipart message.
///
/// Wire format: `[4-byte body length as u32 big-endian]` followed by each
/// frame as `[4-byte frame length][frame bytes]`.
///
/// # Arguments
///
/// * `stream` - The stream to write to
/// * `frames` - The frames to send, in order
pub async fn write_frames<W>(stream: &mut W, frames: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_len: usize = frames.iter().map(|f| 4 + f.len()).sum();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(MeshError::MessageTooLarge(body_len));
    }

    // One contiguous write per message keeps frames of a message together
    // on the wire.
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    stream
        .write_all(&buf)
        .await
        .map_err(|e| MeshError::Connection(format!("writing message: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| MeshError::Connection(format!("flushing stream: {}", e)))?;

    Ok(())
}

/// Reads one multipart message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly at a
/// message boundary.
///
/// # Errors
///
/// Returns an error if the body length exceeds [`MAX_MESSAGE_SIZE`], the
/// frame lengths are inconsistent with the body length, or the stream
/// fails mid-message.
pub async fn read_frames<R>(stream: &mut R) -> Result<Option<Frames>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MeshError::Connection(format!("reading message length: {}", e))),
    }

    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(MeshError::MessageTooLarge(body_len));
    }

    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| MeshError::Connection(format!("reading message body: {}", e)))?;

    let mut body = Bytes::from(body);
    let mut frames = Frames::new();
    while !body.is_empty() {
        if body.len() < 4 {
            return Err(MeshError::Protocol(
                "truncated frame length in message body".to_string(),
            ));
        }
        let frame_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let _ = body.split_to(4);
        if body.len() < frame_len {
            return Err(MeshError::Protocol(format!(
                "frame length {} exceeds remaining body {}",
                frame_len,
                body.len()
            )));
        }
        frames.push(body.split_to(frame_len));
    }

    Ok(Some(frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frames = vec![
            Bytes::from_static(b"identity"),
            Bytes::new(),
            Bytes::from_static(b"hello world"),
        ];
        write_frames(&mut client, &frames).await.unwrap();

        let received = read_frames(&mut server).await.unwrap().unwrap();
        assert_eq!(received, frames);
    }

    #[tokio::test]
    async fn test_empty_frames_preserved() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let frames = vec![Bytes::new(), Bytes::new()];
        write_frames(&mut client, &frames).await.unwrap();

        let received = read_frames(&mut server).await.unwrap().unwrap();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|f| f.is_empty()));
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let received = read_frames(&mut server).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_multiple_messages_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        for i in 0..3u8 {
            let frames = vec![Bytes::copy_from_slice(&[i])];
            write_frames(&mut client, &frames).await.unwrap();
        }

        for i in 0..3u8 {
            let received = read_frames(&mut server).await.unwrap().unwrap();
            assert_eq!(received[0].as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);

        let frames = vec![Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1])];
        let err = write_frames(&mut client, &frames).await.unwrap_err();
        assert!(matches!(err, MeshError::MessageTooLarge(_)));
    }
}
