use std::io;
use std::sync::Weak;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info_span, trace, Instrument};
use crate::command::frame_io::{read_frame, write_frame};
use crate::command::registry::CommandRegistry;
use crate::command::Command;
use crate::connection::LogicalConnection;
use crate::error::SessionError;
use crate::identity::ConnectionIdentity;
use crate::transport::{BoxedReader, BoxedWriter, PhysicalSocket};

/// Which of a binding's tasks noticed that the physical socket is broken
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LossSource {
    Reader,
    Writer,
}

/// The physical socket currently bound to a logical connection, represented by its reader and
///  writer tasks.
///
/// Frames are handed to the writer task through an unbounded channel so that nobody holding the
///  connection's lock ever waits for a socket. The channel's content is bounded by the send window
///  plus a handful of control frames.
pub struct PhysicalSocketBinding {
    generation: u64,
    peer: String,
    tx: mpsc::UnboundedSender<Command>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl PhysicalSocketBinding {
    pub fn spawn(
        socket: PhysicalSocket,
        generation: u64,
        identity: &ConnectionIdentity,
        conn: Weak<LogicalConnection>,
        commands: CommandRegistry,
        max_frame_len: usize,
        idle_timeout: Duration,
    ) -> PhysicalSocketBinding {
        let span = info_span!("physical socket", %identity, generation, peer = %socket.peer);
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(
            run_writer(socket.writer, rx, generation, conn.clone())
                .instrument(span.clone())
        );
        let reader = tokio::spawn(
            run_reader(socket.reader, generation, conn, commands, max_frame_len, idle_timeout)
                .instrument(span)
        );

        PhysicalSocketBinding {
            generation,
            peer: socket.peer,
            tx,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&self, command: Command) {
        // if the writer is gone, it reported the loss and the frame is recovered by the rejoin
        if self.tx.send(command).is_err() {
            trace!("writer for binding {} is gone - dropping frame", self.generation);
        }
    }

    /// A newer physical socket took over: both tasks are stopped without writing anything further
    pub fn supersede(self) {
        debug!("tearing down superseded binding {} to {}", self.generation, self.peer);
        self.reader.abort();
        self.writer.abort();
    }

    /// Stops the task that did not notice the loss; the other one terminates by itself
    pub fn on_loss(self, source: LossSource) {
        match source {
            LossSource::Reader => self.writer.abort(),
            LossSource::Writer => self.reader.abort(),
        }
    }

    /// Graceful end of the connection: the writer sends what is queued and shuts down the write
    ///  half. The reader stops after dispatching the frame that finished the connection.
    pub fn finish(self) {
        drop(self.tx);
    }
}

async fn run_writer(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<Command>, generation: u64, conn: Weak<LogicalConnection>) {
    while let Some(command) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &command).await {
            if let Some(conn) = conn.upgrade() {
                conn.on_socket_lost(generation, LossSource::Writer, &e).await;
            }
            return;
        }
    }

    trace!("binding {} finished - shutting down write half", generation);
    if let Err(e) = writer.shutdown().await {
        debug!("error shutting down write half: {}", e);
    }
}

/// The peer sends keepalives on an idle connection, so a socket that stays silent for the idle
///  timeout is broken even if the transport did not notice.
async fn run_reader(mut reader: BoxedReader, generation: u64, conn: Weak<LogicalConnection>, commands: CommandRegistry, max_frame_len: usize, idle_timeout: Duration) {
    loop {
        let result = match tokio::time::timeout(idle_timeout, read_frame(&mut reader, &commands, max_frame_len)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::TransportIo(io::Error::new(io::ErrorKind::TimedOut, format!("nothing received for {:?}", idle_timeout)))),
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };

        match result {
            Ok(command) => {
                trace!("received {:?}", command.id());
                if !conn.on_command(generation, command).await {
                    return;
                }
            }
            Err(e) => {
                conn.on_socket_lost(generation, LossSource::Reader, &e).await;
                return;
            }
        }
    }
}
