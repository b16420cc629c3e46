use std::sync::Arc;
use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use crate::connection::{ConnectionState, LogicalConnection};
use crate::error::SessionError;
use crate::identity::ConnectionIdentity;

/// The application's handle on a logical connection: an ordered, reliable byte stream that survives
///  the loss of physical sockets.
///
/// Reads stall (but do not fail) while the connection is rejoining, and writes stall when the send
///  window is full. Use [NonBreakingStream::into_split] to read and write from different tasks.
pub struct NonBreakingStream {
    reader: NonBreakingReadHalf,
    writer: NonBreakingWriteHalf,
}

impl NonBreakingStream {
    pub(crate) fn new(conn: Arc<LogicalConnection>, incoming: mpsc::UnboundedReceiver<Bytes>) -> NonBreakingStream {
        NonBreakingStream {
            reader: NonBreakingReadHalf {
                conn: conn.clone(),
                incoming,
                leftover: Bytes::new(),
            },
            writer: NonBreakingWriteHalf { conn },
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        self.writer.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.writer.state()
    }

    pub fn connection(&self) -> &Arc<LogicalConnection> {
        self.writer.connection()
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), SessionError> {
        self.writer.write_all(data).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.reader.read(buf).await
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
        self.reader.read_chunk().await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        self.reader.read_exact(buf).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (NonBreakingReadHalf, NonBreakingWriteHalf) {
        (self.reader, self.writer)
    }
}

pub struct NonBreakingReadHalf {
    conn: Arc<LogicalConnection>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    /// the part of a received chunk that did not fit into the caller's buffer
    leftover: Bytes,
}

impl NonBreakingReadHalf {
    pub fn identity(&self) -> &ConnectionIdentity {
        self.conn.identity()
    }

    pub fn connection(&self) -> &Arc<LogicalConnection> {
        &self.conn
    }

    /// Returns the next chunk of received data in order, or `None` at the end of the stream (i.e.
    ///  after a graceful close). Chunk boundaries carry no meaning.
    ///
    /// Received data is acked to the peer only once it was read here, so a peer writing to a
    ///  connection that is not read blocks on its send window.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
        if !self.leftover.is_empty() {
            return Ok(Some(std::mem::take(&mut self.leftover)));
        }

        match self.incoming.recv().await {
            Some(chunk) => {
                let consumed = self.conn.register_consumed();
                // parked until the ack is through, so a cancelled read loses nothing
                self.leftover = chunk;
                if consumed % self.conn.config().ack_threshold() == 0 {
                    self.conn.on_app_progress().await;
                }
                Ok(Some(std::mem::take(&mut self.leftover)))
            }
            None => match self.conn.terminal_error().await {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Reads up to `buf.len()` bytes, returning 0 at the end of the stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some(mut chunk) = self.read_chunk().await? else {
            return Ok(0);
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.advance(n);
        self.leftover = chunk;
        Ok(n)
    }

    /// Fills `buf` completely. Reaching the end of the stream before that is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(SessionError::Closed),
                n => filled += n,
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NonBreakingWriteHalf {
    conn: Arc<LogicalConnection>,
}

impl NonBreakingWriteHalf {
    pub fn identity(&self) -> &ConnectionIdentity {
        self.conn.identity()
    }

    pub fn connection(&self) -> &Arc<LogicalConnection> {
        &self.conn
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Returns once all data is registered for sending, which is not necessarily when the peer
    ///  received it. Fails once the connection is closing.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), SessionError> {
        let data = Bytes::copy_from_slice(data);
        let chunk_len = self.conn.config().max_data_chunk_len;

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_len).min(data.len());
            self.conn.send(data.slice(offset..end)).await?;
            offset = end;
        }
        Ok(())
    }

    /// Closes the connection gracefully, waiting until both sides received everything
    pub async fn close(&self) -> Result<(), SessionError> {
        self.conn.close().await
    }
}
