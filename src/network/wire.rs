use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger than this is a
/// malformed or hostile peer, not a real protocol message.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed frame: 4-byte big-endian payload
/// length, then the payload.
pub async fn write_frame<W>(
  writer: &mut W,
  payload: &[u8],
) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let len = payload.len() as u32;
  writer.write_all(&len.to_be_bytes()).await?;
  writer.write_all(payload).await?;
  writer.flush().await
}

/// Reads one length-prefixed frame. Fails on EOF mid-frame and on
/// oversized length prefixes.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  let mut len_bytes = [0u8; 4];
  reader.read_exact(&mut len_bytes).await?;
  let len = u32::from_be_bytes(len_bytes) as usize;
  if len > MAX_FRAME_SIZE {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} limit"),
    ));
  }
  let mut payload = vec![0u8; len];
  reader.read_exact(&mut payload).await?;
  Ok(payload)
}

#[cfg(test)]
mod test {
  use super::{read_frame, write_frame};

  #[tokio::test]
  async fn frame_roundtrip() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, b"hello consensus").await.unwrap();
    assert_eq!(&buffer[..4], &15u32.to_be_bytes());

    let mut cursor = std::io::Cursor::new(buffer);
    let payload = read_frame(&mut cursor).await.unwrap();
    assert_eq!(payload, b"hello consensus");
  }

  #[tokio::test]
  async fn oversized_frame_is_rejected() {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&u32::MAX.to_be_bytes());
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(read_frame(&mut cursor).await.is_err());
  }

  #[tokio::test]
  async fn truncated_frame_is_an_error() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, b"full frame").await.unwrap();
    buffer.truncate(buffer.len() - 3);
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(read_frame(&mut cursor).await.is_err());
  }
}
