//! The node is the local endpoint of non-breaking connections: it opens connections actively,
//!  accepts them passively, and routes inbound physical sockets to the logical connection they
//!  belong to.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, debug_span, error, info, warn, Instrument};
use uuid::Uuid;
use crate::command::frame_io::{read_frame_within, write_frame};
use crate::command::registry::CommandRegistry;
use crate::command::Command;
use crate::config::NonBreakingConfig;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::stream::NonBreakingStream;
use crate::connection::{LogicalConnection, Role};
use crate::error::SessionError;
use crate::identity::ConnectionIdentity;
use crate::reconnect;
use crate::transport::{port_of, Acceptor, Connector, PhysicalSocket};

pub struct NonBreakingNode {
    node_uuid: String,
    config: Arc<NonBreakingConfig>,
    commands: CommandRegistry,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    next_connection_id: AtomicU32,
    accept_tx: mpsc::Sender<NonBreakingStream>,
    accept_rx: Mutex<mpsc::Receiver<NonBreakingStream>>,
}

impl NonBreakingNode {
    pub fn new(config: NonBreakingConfig, connector: Arc<dyn Connector>) -> anyhow::Result<Arc<NonBreakingNode>> {
        Self::with_command_registry(config, connector, CommandRegistry::standard())
    }

    /// for running with a command registry that has additional (or replaced) decoders
    pub fn with_command_registry(config: NonBreakingConfig, connector: Arc<dyn Connector>, commands: CommandRegistry) -> anyhow::Result<Arc<NonBreakingNode>> {
        config.validate()?;

        let node_uuid = Uuid::new_v4().to_string();
        info!("starting node {}", node_uuid);

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_len);
        Ok(Arc::new(NonBreakingNode {
            node_uuid,
            config: Arc::new(config),
            commands,
            connector,
            registry: Arc::new(ConnectionRegistry::new()),
            next_connection_id: AtomicU32::new(1),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        }))
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub fn config(&self) -> &NonBreakingConfig {
        &self.config
    }

    /// connections that are not closed yet, both active and passive
    pub async fn num_connections(&self) -> usize {
        self.registry.len().await
    }

    pub async fn connection_identities(&self) -> Vec<ConnectionIdentity> {
        self.registry.identities().await
    }

    /// Opens a new logical connection to the node listening at `addr`. The connection is
    ///  registered while it is opening, and deregistered again if the handshake fails.
    pub async fn connect(&self, addr: &str) -> Result<NonBreakingStream, SessionError> {
        let identity = ConnectionIdentity::new(
            self.node_uuid.clone(),
            self.next_connection_id.fetch_add(1, Ordering::AcqRel),
        );
        let role = Role::Active {
            addr: addr.to_string(),
            connector: self.connector.clone(),
        };

        let (conn, incoming) = LogicalConnection::new(identity.clone(), role, self.config.clone(), self.commands.clone(), Arc::downgrade(&self.registry));
        self.registry.insert(conn.clone()).await;

        match self.open(&identity, addr).await {
            Ok(socket) => {
                conn.establish(socket, None).await;
                info!("opened connection {} to {}", identity, addr);
                Ok(NonBreakingStream::new(conn, incoming))
            }
            Err(e) => {
                debug!("opening connection {} to {} failed: {}", identity, addr, e);
                conn.fail_open().await;
                Err(e)
            }
        }
    }

    async fn open(&self, identity: &ConnectionIdentity, addr: &str) -> Result<PhysicalSocket, SessionError> {
        let mut socket = match timeout(self.config.connect_timeout, self.connector.connect(addr)).await {
            Ok(socket) => socket?,
            Err(_) => return Err(SessionError::HandshakeTimeout),
        };

        write_frame(&mut socket.writer, &Command::NewConn {
            identity: identity.clone(),
            connector_ip: socket.local_ip.clone(),
            server_port: port_of(addr),
        }).await?;

        match read_frame_within(&mut socket.reader, &self.commands, self.config.max_frame_len, self.config.handshake_timeout).await? {
            Command::AckNewConn { identity: acked, .. } if &acked == identity => Ok(socket),
            other => Err(SessionError::ProtocolViolation(format!("expected AckNewConn for {}, got {:?}", identity, other.id()))),
        }
    }

    /// Waits for the next passively opened connection. Returns `None` only if the node is shutting
    ///  down.
    pub async fn accept(&self) -> Option<NonBreakingStream> {
        self.accept_rx.lock().await
            .recv().await
    }

    /// The accept loop: each inbound physical socket is handled in a task of its own. This returns
    ///  only if the acceptor fails.
    pub async fn serve(self: Arc<Self>, acceptor: Arc<dyn Acceptor>) -> anyhow::Result<()> {
        loop {
            let socket = match acceptor.accept().await {
                Ok(socket) => socket,
                Err(e) => {
                    error!("error accepting physical connection: {}", e);
                    return Err(e.into());
                }
            };

            let span = debug_span!("inbound", peer = %socket.peer);
            let node = self.clone();
            tokio::spawn(async move {
                node.on_inbound(socket).await
            }.instrument(span));
        }
    }

    /// The first frame on an inbound socket decides what it is for
    async fn on_inbound(&self, mut socket: PhysicalSocket) {
        let first = match read_frame_within(&mut socket.reader, &self.commands, self.config.max_frame_len, self.config.handshake_timeout).await {
            Ok(command) => command,
            Err(e) => {
                debug!("dropping inbound socket from {}: {}", socket.peer, e);
                return;
            }
        };

        let result = match first {
            Command::NewConn { identity, connector_ip, server_port } =>
                self.on_new_conn(socket, identity, connector_ip, server_port).await,
            Command::ReadyToJoin { identity } =>
                reconnect::on_ready_to_join(&self.registry, socket, identity, &self.config, &self.commands).await,
            Command::JoinConn { identity } =>
                reconnect::on_join(&self.registry, socket, identity, false).await,
            Command::JoinCloseConn { identity } =>
                reconnect::on_join(&self.registry, socket, identity, true).await,
            other => Err(SessionError::ProtocolViolation(format!("{:?} can not start a physical socket", other.id()))),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_transport_level() => debug!("inbound handshake failed: {}", e),
            Err(e) => warn!("inbound handshake failed: {}", e),
        }
    }

    async fn on_new_conn(&self, socket: PhysicalSocket, identity: ConnectionIdentity, connector_ip: String, server_port: u32) -> Result<(), SessionError> {
        debug!("peer {} at {} opens connection {} (port {})", socket.peer, connector_ip, identity, server_port);

        let (conn, incoming) = LogicalConnection::new(identity.clone(), Role::Passive, self.config.clone(), self.commands.clone(), Arc::downgrade(&self.registry));
        if !self.registry.insert(conn.clone()).await {
            conn.fail_open().await;
            return Err(SessionError::ProtocolViolation(format!("NewConn for existing connection {}", identity)));
        }

        conn.establish(socket, Some(Command::AckNewConn {
            identity: identity.clone(),
            connector_ip,
            server_port,
        })).await;
        info!("accepted connection {}", identity);

        if self.accept_tx.send(NonBreakingStream::new(conn, incoming)).await.is_err() {
            warn!("no longer accepting connections, dropping {}", identity);
        }
        Ok(())
    }
}
