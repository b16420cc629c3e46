//! The physical transport that the session layer runs on. Any reliable, in-order byte stream will
//!  do; decorators (TLS, obfuscation, quotas, ...) live below this abstraction.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One physical connection, split into its read and write halves
pub struct PhysicalSocket {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// the local IP address as reported in `NewConn`
    pub local_ip: String,
    /// for logging only
    pub peer: String,
}

impl Debug for PhysicalSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicalSocket{{{}->{}}}", self.local_ip, self.peer)
    }
}

impl PhysicalSocket {
    pub fn from_tcp(stream: TcpStream) -> std::io::Result<PhysicalSocket> {
        stream.set_nodelay(true)?;
        let local_ip = stream.local_addr()?.ip().to_string();
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(PhysicalSocket {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_ip,
            peer,
        })
    }
}

/// Opens physical connections for active opens and for rejoining
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> std::io::Result<PhysicalSocket>;
}

/// Source of inbound physical connections for passive opens and rejoins
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> std::io::Result<PhysicalSocket>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> std::io::Result<PhysicalSocket> {
        debug!("connecting to {}", addr);
        PhysicalSocket::from_tcp(TcpStream::connect(addr).await?)
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> std::io::Result<TcpAcceptor> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {:?}", listener.local_addr()?);
        Ok(TcpAcceptor { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> std::io::Result<PhysicalSocket> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("accepted physical connection from {:?}", addr);
        PhysicalSocket::from_tcp(stream)
    }
}

/// The port part of an address in `host:port` notation, 0 if there is none
pub fn port_of(addr: &str) -> u32 {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .map(|port| port as u32)
        .unwrap_or(0)
}
