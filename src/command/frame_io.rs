use std::time::Duration;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;
use crate::command::registry::{parse_frame_header, CommandRegistry};
use crate::command::{Command, FRAME_HEADER_LEN};
use crate::error::SessionError;

/// Reads a single frame. An EOF before or inside a frame is reported as a transport error, frames
///  with a length beyond `max_frame_len` as framing errors without reading their payload.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    registry: &CommandRegistry,
    max_frame_len: usize,
) -> Result<Command, SessionError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let (raw_id, total_len) = parse_frame_header(&header)?;
    if total_len > max_frame_len {
        return Err(SessionError::Framing(format!("frame length {} exceeds the configured maximum of {}", total_len, max_frame_len)));
    }
    if !registry.is_registered(raw_id) {
        return Err(SessionError::Framing(format!("unknown command id {}", raw_id)));
    }

    let mut payload = vec![0u8; total_len - FRAME_HEADER_LEN];
    reader.read_exact(&mut payload).await?;

    registry.decode(raw_id, &payload)
}

/// Handshake variant of [read_frame]: waiting for the frame is bounded by `max_wait`
pub async fn read_frame_within<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    registry: &CommandRegistry,
    max_frame_len: usize,
    max_wait: Duration,
) -> Result<Command, SessionError> {
    match timeout(max_wait, read_frame(reader, registry, max_frame_len)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::HandshakeTimeout),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, command: &Command) -> Result<(), SessionError> {
    trace!("writing {:?}", command.id());

    let mut buf = BytesMut::new();
    command.encode(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
