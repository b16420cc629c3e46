use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::io::{copy_bidirectional, duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;
use crate::transport::{Acceptor, Connector, PhysicalSocket};

const LINK_BUFFER_SIZE: usize = 64*1024;
const ACCEPT_BACKLOG: usize = 64;

/// An in-memory network of named listeners. Every physical link runs through a relay task, and
///  aborting that task breaks the link in both directions, the way a dropped NAT mapping or a
///  pulled cable would.
#[derive(Default)]
pub struct FlakyNetwork {
    listeners: RwLock<FxHashMap<String, mpsc::Sender<PhysicalSocket>>>,
    links: Mutex<Vec<JoinHandle<()>>>,
    next_link_id: AtomicU64,
    refuse_connections: AtomicBool,
}

impl FlakyNetwork {
    pub fn new() -> Arc<FlakyNetwork> {
        Default::default()
    }

    /// Registers a listener under `addr`, replacing a previous one
    pub async fn listen(&self, addr: &str) -> MemoryAcceptor {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.listeners.write().await
            .insert(addr.to_string(), tx);
        MemoryAcceptor {
            inbound: Mutex::new(rx),
        }
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector { network: self.clone() })
    }

    /// While set, all connection attempts fail as if the peer were unreachable
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::Release);
    }

    pub async fn num_live_links(&self) -> usize {
        let mut links = self.links.lock().await;
        links.retain(|l| !l.is_finished());
        links.len()
    }

    /// returns the number of links that were killed
    pub async fn kill_all_links(&self) -> usize {
        let mut links = self.links.lock().await;
        links.retain(|l| !l.is_finished());
        for link in links.iter() {
            link.abort();
        }
        let result = links.len();
        links.clear();
        debug!("killed {} links", result);
        result
    }

    /// returns `false` if there was no live link to kill
    pub async fn kill_random_link(&self) -> bool {
        let mut links = self.links.lock().await;
        links.retain(|l| !l.is_finished());
        if links.is_empty() {
            return false;
        }

        let idx = rand::thread_rng().gen_range(0..links.len());
        links.swap_remove(idx).abort();
        debug!("killed a random link");
        true
    }

    async fn connect(&self, addr: &str) -> std::io::Result<PhysicalSocket> {
        if self.refuse_connections.load(Ordering::Acquire) {
            return Err(ErrorKind::ConnectionRefused.into());
        }
        let listener = self.listeners.read().await
            .get(addr)
            .cloned()
            .ok_or_else(|| std::io::Error::from(ErrorKind::ConnectionRefused))?;

        let link_id = self.next_link_id.fetch_add(1, Ordering::AcqRel);
        let (client_side, mut client_relay) = duplex(LINK_BUFFER_SIZE);
        let (server_side, mut server_relay) = duplex(LINK_BUFFER_SIZE);

        let link = tokio::spawn(async move {
            let _ = copy_bidirectional(&mut client_relay, &mut server_relay).await;
        });
        self.links.lock().await.push(link);

        listener.send(memory_socket(server_side, format!("link-{}", link_id))).await
            .map_err(|_| std::io::Error::from(ErrorKind::ConnectionRefused))?;
        Ok(memory_socket(client_side, addr.to_string()))
    }
}

fn memory_socket(stream: DuplexStream, peer: String) -> PhysicalSocket {
    let (reader, writer) = tokio::io::split(stream);
    PhysicalSocket {
        reader: Box::new(reader),
        writer: Box::new(writer),
        local_ip: "127.0.0.1".to_string(),
        peer,
    }
}

pub struct MemoryConnector {
    network: Arc<FlakyNetwork>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &str) -> std::io::Result<PhysicalSocket> {
        self.network.connect(addr).await
    }
}

pub struct MemoryAcceptor {
    inbound: Mutex<mpsc::Receiver<PhysicalSocket>>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> std::io::Result<PhysicalSocket> {
        self.inbound.lock().await
            .recv().await
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected))
    }
}
