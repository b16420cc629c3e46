//! A logical connection and everything it is made of.
//!
//! [LogicalConnection] is the shared handle: it owns the [brain::Brain] behind a lock and turns
//!  the brain's synchronous operations into async ones (waiting for send window permits, for the
//!  lock, or for the connection to be closed).

pub mod binding;
pub mod brain;
pub mod receive_buffer;
pub mod registry;
pub mod send_buffer;
pub mod stream;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug_span, Instrument};
use crate::command::registry::CommandRegistry;
use crate::command::{Command, JoinStatus};
use crate::config::NonBreakingConfig;
use crate::connection::binding::LossSource;
use crate::connection::brain::Brain;
use crate::connection::registry::ConnectionRegistry;
use crate::error::{DisconnectReason, SessionError};
use crate::identity::ConnectionIdentity;
use crate::packet_id::PacketId;
use crate::transport::{Connector, PhysicalSocket};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Opening,
    /// a physical socket is bound
    Established,
    /// no physical socket is bound, and a rejoin is in progress (or awaited on the passive side)
    RejoinPending,
    Closing,
    Closed,
}

/// Which side of the connection we are. Only the active side dials, both for opening and for
///  rejoining.
#[derive(Clone)]
pub enum Role {
    Active {
        addr: String,
        connector: Arc<dyn Connector>,
    },
    Passive,
}

impl Debug for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Active { addr, .. } => write!(f, "Active({})", addr),
            Role::Passive => write!(f, "Passive"),
        }
    }
}

pub enum JoinOutcome {
    Joined,
    /// the socket is handed back so the caller can send the status to the peer
    Rejected(JoinStatus, PhysicalSocket),
}

pub struct LogicalConnection {
    identity: ConnectionIdentity,
    config: Arc<NonBreakingConfig>,
    commands: CommandRegistry,
    brain: Mutex<Brain>,
    state: watch::Receiver<ConnectionState>,
    send_permits: Arc<Semaphore>,
    /// shared with the brain, which acks only what the application consumed
    app_consumed: Arc<AtomicU64>,
    registry: Weak<ConnectionRegistry>,
}

impl Debug for LogicalConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogicalConnection{{{}:{:?}}}", self.identity, *self.state.borrow())
    }
}

impl LogicalConnection {
    /// Creates a connection in state [ConnectionState::Opening]. The returned receiver gets the
    ///  application data in order, and it is closed when the connection is.
    pub fn new(
        identity: ConnectionIdentity,
        role: Role,
        config: Arc<NonBreakingConfig>,
        commands: CommandRegistry,
        registry: Weak<ConnectionRegistry>,
    ) -> (Arc<LogicalConnection>, mpsc::UnboundedReceiver<Bytes>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Opening);
        let send_permits = Arc::new(Semaphore::new(config.send_window_packets));
        let app_consumed = Arc::new(AtomicU64::new(0));

        let conn = Arc::new_cyclic(|myself| LogicalConnection {
            brain: Mutex::new(Brain::new(
                identity.clone(),
                role,
                config.clone(),
                commands.clone(),
                myself.clone(),
                state_tx,
                send_permits.clone(),
                app_tx,
                app_consumed.clone(),
            )),
            identity,
            config,
            commands,
            state: state_rx,
            send_permits,
            app_consumed,
            registry,
        });

        let span = debug_span!("ack ticker", identity = %conn.identity);
        tokio::spawn(run_ticker(Arc::downgrade(&conn), conn.config.ack_interval, conn.config.keepalive_interval).instrument(span));

        (conn, app_rx)
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NonBreakingConfig {
        &self.config
    }

    pub(crate) fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// NB: The brain's operations are synchronous, so the only point where a caller can be
    ///  cancelled is while waiting for the lock.
    async fn with_brain<R>(&self, f: impl FnOnce(&mut Brain) -> R) -> R {
        let (result, deregister) = {
            let mut brain = self.brain.lock().await;
            let result = f(&mut brain);
            (result, brain.take_deregister())
        };

        if deregister {
            if let Some(registry) = self.registry.upgrade() {
                registry.deregister(self).await;
            }
        }
        result
    }

    pub async fn num_pending_packets(&self) -> usize {
        self.with_brain(|brain| brain.num_pending_packets()).await
    }

    pub async fn receive_cursor(&self) -> PacketId {
        self.with_brain(|brain| brain.receive_cursor()).await
    }

    pub async fn num_packets_sent(&self) -> u32 {
        self.with_brain(|brain| brain.num_packets_sent()).await
    }

    pub async fn current_generation(&self) -> Option<u64> {
        self.with_brain(|brain| brain.current_generation()).await
    }

    pub async fn terminal_error(&self) -> Option<SessionError> {
        self.with_brain(|brain| brain.terminal_error()).await
    }

    pub async fn is_closing(&self) -> bool {
        self.with_brain(|brain| brain.is_closing()).await
    }

    /// Binds the first physical socket after a successful handshake
    pub async fn establish(&self, socket: PhysicalSocket, first_frame: Option<Command>) {
        self.with_brain(|brain| brain.establish(socket, first_frame)).await
    }

    pub async fn fail_open(&self) {
        self.with_brain(|brain| brain.fail_open()).await
    }

    /// Sends a single data packet, waiting for room in the send window
    pub async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let permit = match self.send_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(self.terminal_error().await.unwrap_or(SessionError::Closed)),
        };

        self.with_brain(|brain| brain.send_data(payload)).await?;
        // the permit is returned when the peer acks the packet
        permit.forget();
        Ok(())
    }

    /// Starts the close handshake and waits for it to complete
    pub async fn close(&self) -> Result<(), SessionError> {
        self.with_brain(|brain| brain.request_close()).await;
        self.wait_closed().await
    }

    /// Waits until the connection is closed. Returns the terminal error if it was not closed
    ///  gracefully.
    pub async fn wait_closed(&self) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;

        match self.terminal_error().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Counts one more received chunk as taken by the application, returning the new total
    pub(crate) fn register_consumed(&self) -> u64 {
        self.app_consumed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) async fn on_app_progress(&self) {
        self.with_brain(|brain| brain.on_app_progress()).await
    }

    pub(crate) async fn on_command(&self, generation: u64, command: Command) -> bool {
        self.with_brain(|brain| brain.on_command(generation, command)).await
    }

    pub(crate) async fn on_socket_lost(&self, generation: u64, source: LossSource, err: &SessionError) {
        self.with_brain(|brain| brain.on_socket_lost(generation, source, err)).await
    }

    pub(crate) async fn complete_active_rejoin(&self, socket: PhysicalSocket, peer_cursor: PacketId) -> bool {
        self.with_brain(|brain| brain.complete_active_rejoin(socket, peer_cursor)).await
    }

    pub(crate) async fn reserve_join(&self) -> Result<u64, JoinStatus> {
        self.with_brain(|brain| brain.reserve_join()).await
    }

    pub(crate) async fn release_join(&self, reservation: u64) {
        self.with_brain(|brain| brain.release_join(reservation)).await
    }

    /// Binds a physical socket that arrived with `JoinConn` (or `JoinCloseConn`), superseding the
    ///  current one if it is still there.
    pub(crate) async fn passive_join(&self, socket: PhysicalSocket, join_close: bool, reservation: Option<u64>) -> JoinOutcome {
        self.with_brain(|brain| match brain.join_status(reservation) {
            JoinStatus::Accepted => {
                brain.complete_passive_join(socket, join_close);
                JoinOutcome::Joined
            }
            status => JoinOutcome::Rejected(status, socket),
        }).await
    }

    pub(crate) async fn abandon(&self, reason: DisconnectReason) {
        self.with_brain(|brain| brain.abandon(reason)).await
    }
}

/// Periodic acks and keepalives for as long as the connection is open
async fn run_ticker(conn: Weak<LogicalConnection>, ack_period: Duration, keepalive_period: Duration) {
    let mut ack_ticks = tokio::time::interval(ack_period);
    ack_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive_ticks = tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
    keepalive_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let keepalive = tokio::select! {
            _ = ack_ticks.tick() => false,
            _ = keepalive_ticks.tick() => true,
        };

        let Some(conn) = conn.upgrade() else {
            return;
        };
        let open = if keepalive {
            conn.with_brain(|brain| brain.send_keepalive()).await
        }
        else {
            conn.with_brain(|brain| brain.flush_ack()).await
        };
        if !open {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;
    use crate::command::frame_io::{read_frame, write_frame};
    use crate::connection::stream::NonBreakingStream;
    use crate::transport::MockConnector;
    use super::*;

    pub fn socket_pair() -> (PhysicalSocket, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let socket = PhysicalSocket {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_ip: "127.0.0.1".to_string(),
            peer: "scripted peer".to_string(),
        };
        (socket, remote)
    }

    /// The other end of a physical socket, driven frame by frame by the test
    pub struct ScriptedPeer {
        pub stream: DuplexStream,
        commands: CommandRegistry,
    }

    impl ScriptedPeer {
        pub fn new(stream: DuplexStream) -> ScriptedPeer {
            ScriptedPeer {
                stream,
                commands: CommandRegistry::standard(),
            }
        }

        pub async fn send(&mut self, command: Command) {
            write_frame(&mut self.stream, &command).await.unwrap();
        }

        pub async fn recv(&mut self) -> Command {
            timeout(Duration::from_secs(10), read_frame(&mut self.stream, &self.commands, 1024*1024)).await
                .expect("no frame received")
                .unwrap()
        }

        pub async fn expect_silence(&mut self) {
            let result = timeout(Duration::from_secs(1), read_frame(&mut self.stream, &self.commands, 1024*1024)).await;
            assert!(result.is_err(), "unexpected frame {:?}", result);
        }
    }

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new("node-a", 1)
    }

    pub fn quiet_config() -> NonBreakingConfig {
        let mut config = NonBreakingConfig::new();
        config.ack_every_n_packets = 1000;
        config.ack_interval = Duration::from_secs(3600);
        config.keepalive_interval = Duration::from_secs(3600);
        config.link_idle_timeout = Duration::from_secs(7200);
        config
    }

    async fn established(role: Role, config: NonBreakingConfig) -> (Arc<LogicalConnection>, NonBreakingStream, ScriptedPeer) {
        let (conn, incoming) = LogicalConnection::new(identity(), role, Arc::new(config), CommandRegistry::standard(), Weak::new());
        let (socket, remote) = socket_pair();
        conn.establish(socket, None).await;
        assert_eq!(conn.state(), ConnectionState::Established);

        let stream = NonBreakingStream::new(conn.clone(), incoming);
        (conn, stream, ScriptedPeer::new(remote))
    }

    fn data(packet_id: u32) -> Command {
        Command::Data {
            packet_id: PacketId::from_raw(packet_id),
            payload: payload(packet_id),
        }
    }

    fn payload(packet_id: u32) -> Bytes {
        Bytes::from(format!("packet {}", packet_id))
    }

    async fn wait_for_state(conn: &LogicalConnection, expected: ConnectionState) {
        let mut state = conn.subscribe_state();
        timeout(Duration::from_secs(10), state.wait_for(|s| *s == expected)).await
            .expect("state not reached")
            .unwrap();
    }

    async fn wait_for_pending(conn: &LogicalConnection, expected: usize) {
        for _ in 0..1000 {
            if conn.num_pending_packets().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} pending packets, were {}", expected, conn.num_pending_packets().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_ack() {
        let (conn, stream, mut peer) = established(Role::Passive, quiet_config()).await;

        stream.write_all(b"AB").await.unwrap();
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::ZERO, payload: Bytes::from_static(b"AB") });
        assert_eq!(conn.num_pending_packets().await, 1);

        peer.send(Command::DataReceived { last_packet_received: PacketId::ZERO }).await;
        wait_for_pending(&conn, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_chunked() {
        let mut config = quiet_config();
        config.max_data_chunk_len = 4;
        let (_conn, stream, mut peer) = established(Role::Passive, config).await;

        stream.write_all(b"0123456789").await.unwrap();
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(0), payload: Bytes::from_static(b"0123") });
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(1), payload: Bytes::from_static(b"4567") });
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(2), payload: Bytes::from_static(b"89") });
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_window_blocks_writer() {
        let mut config = quiet_config();
        config.send_window_packets = 2;
        let (conn, stream, mut peer) = established(Role::Passive, config).await;

        stream.write_all(b"a").await.unwrap();
        stream.write_all(b"b").await.unwrap();
        assert!(timeout(Duration::from_secs(1), stream.write_all(b"c")).await.is_err());

        peer.recv().await;
        peer.recv().await;
        peer.send(Command::DataReceived { last_packet_received: PacketId::ZERO }).await;
        timeout(Duration::from_secs(1), stream.write_all(b"c")).await.unwrap().unwrap();
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(2), payload: Bytes::from_static(b"c") });
        assert_eq!(conn.num_pending_packets().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_requested_and_filled() {
        let (_conn, mut stream, mut peer) = established(Role::Passive, quiet_config()).await;

        for i in 0..5 {
            peer.send(data(i)).await;
        }
        peer.send(data(7)).await;
        assert_eq!(peer.recv().await, Command::DataRequest { first_packet_to_resend: PacketId::from_raw(5) });

        peer.send(data(5)).await;
        peer.send(data(6)).await;
        for i in 0..8 {
            assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(i)));
        }
        peer.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_ignored() {
        let (_conn, mut stream, mut peer) = established(Role::Passive, quiet_config()).await;

        peer.send(data(0)).await;
        peer.send(data(1)).await;
        peer.send(data(0)).await;
        peer.send(data(2)).await;

        for i in 0..3 {
            assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(i)));
        }
        assert!(timeout(Duration::from_secs(1), stream.read_chunk()).await.is_err());
        peer.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_every_n_packets() {
        let mut config = quiet_config();
        config.ack_every_n_packets = 3;
        let (_conn, mut stream, mut peer) = established(Role::Passive, config).await;

        for i in 0..7 {
            peer.send(data(i)).await;
        }
        // received is not enough, the application has to read it
        peer.expect_silence().await;

        for i in 0..7 {
            assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(i)));
        }
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::from_raw(2) });
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::from_raw(5) });
        peer.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ack() {
        let mut config = quiet_config();
        config.ack_interval = Duration::from_millis(100);
        let (_conn, mut stream, mut peer) = established(Role::Passive, config).await;

        peer.send(data(0)).await;
        peer.send(data(1)).await;
        peer.send(data(2)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(1)));
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::from_raw(1) });
        // nothing new was read, so nothing is acked again
        peer.expect_silence().await;

        peer.send(data(1)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(2)));
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::from_raw(2) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_data_is_not_acked() {
        let mut config = quiet_config();
        config.ack_every_n_packets = 2;
        config.ack_interval = Duration::from_millis(100);
        let (_conn, mut stream, mut peer) = established(Role::Passive, config).await;

        for i in 0..10 {
            peer.send(data(i)).await;
        }
        peer.expect_silence().await;

        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::ZERO });
        peer.expect_silence().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_reader_does_not_hold_back_acks() {
        let mut config = quiet_config();
        config.ack_interval = Duration::from_millis(100);
        let (_conn, stream, mut peer) = established(Role::Passive, config).await;
        let (reader, _writer) = stream.into_split();
        drop(reader);

        peer.send(data(0)).await;
        peer.send(data(1)).await;
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::from_raw(1) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_on_idle_connection() {
        let mut config = quiet_config();
        config.keepalive_interval = Duration::from_secs(5);
        let (_conn, mut stream, mut peer) = established(Role::Passive, config).await;

        // nothing acked yet: the keepalive is a resend request from the cursor
        assert_eq!(peer.recv().await, Command::DataRequest { first_packet_to_resend: PacketId::ZERO });

        peer.send(data(0)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));
        assert_eq!(peer.recv().await, Command::DataRequest { first_packet_to_resend: PacketId::from_raw(1) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_repeats_last_ack() {
        let mut config = quiet_config();
        config.ack_every_n_packets = 1;
        config.keepalive_interval = Duration::from_secs(5);
        let (_conn, mut stream, mut peer) = established(Role::Passive, config).await;

        peer.send(data(0)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::ZERO });
        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::ZERO });
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_triggers_rejoin() {
        let mut config = quiet_config();
        config.link_idle_timeout = Duration::from_secs(20);
        let (conn, _stream, _peer) = established(Role::Passive, config).await;

        let mut state = conn.subscribe_state();
        assert!(timeout(Duration::from_secs(19), state.wait_for(|s| *s == ConnectionState::RejoinPending)).await.is_err());
        wait_for_state(&conn, ConnectionState::RejoinPending).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_request_resends() {
        let (conn, stream, mut peer) = established(Role::Passive, quiet_config()).await;

        for i in 0..5u8 {
            stream.write_all(&[i]).await.unwrap();
            peer.recv().await;
        }

        peer.send(Command::DataRequest { first_packet_to_resend: PacketId::from_raw(3) }).await;
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(3), payload: Bytes::from_static(&[3]) });
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(4), payload: Bytes::from_static(&[4]) });
        // only an ack releases packets
        assert_eq!(conn.num_pending_packets().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_rejoin_resends_from_peer_cursor() {
        let (conn, stream, mut peer) = established(Role::Passive, quiet_config()).await;

        for i in 0..10u8 {
            stream.write_all(&[i]).await.unwrap();
        }
        for _ in 0..10 {
            assert!(matches!(peer.recv().await, Command::Data { .. }));
        }
        drop(peer);
        wait_for_state(&conn, ConnectionState::RejoinPending).await;
        assert_eq!(conn.num_pending_packets().await, 10);

        // written while no physical socket is bound
        stream.write_all(&[10]).await.unwrap();

        let (socket, remote) = socket_pair();
        assert!(matches!(conn.passive_join(socket, false, None).await, JoinOutcome::Joined));
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.current_generation().await, Some(2));

        let mut peer = ScriptedPeer::new(remote);
        assert_eq!(peer.recv().await, Command::AckJoinConn { status: JoinStatus::Accepted, identity: identity() });
        assert_eq!(peer.recv().await, Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::ZERO, identity: identity() });
        // nothing is sent before the peer's cursor is known
        peer.expect_silence().await;

        peer.send(Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::from_raw(5), identity: identity() }).await;
        for i in 5..11u8 {
            assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(i as u32), payload: Bytes::copy_from_slice(&[i]) });
        }
        peer.expect_silence().await;
        assert_eq!(conn.num_pending_packets().await, 11);

        peer.send(Command::DataReceived { last_packet_received: PacketId::from_raw(4) }).await;
        wait_for_pending(&conn, 6).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_supersedes_live_socket() {
        let (conn, _stream, mut old_peer) = established(Role::Passive, quiet_config()).await;

        let (socket, _remote) = socket_pair();
        assert!(matches!(conn.passive_join(socket, false, None).await, JoinOutcome::Joined));
        assert_eq!(conn.current_generation().await, Some(2));

        let mut buf = [0u8; 16];
        assert_eq!(timeout(Duration::from_secs(1), old_peer.stream.read(&mut buf)).await.unwrap().unwrap(), 0);
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_reservation() {
        let (conn, _stream, _peer) = established(Role::Passive, quiet_config()).await;

        let reservation = conn.reserve_join().await.unwrap();
        assert_eq!(conn.reserve_join().await.err(), Some(JoinStatus::Busy));

        let (socket, _remote) = socket_pair();
        let socket = match conn.passive_join(socket, false, None).await {
            JoinOutcome::Rejected(JoinStatus::Busy, socket) => socket,
            _ => panic!("join without the reservation should be rejected"),
        };
        assert!(matches!(conn.passive_join(socket, false, Some(reservation)).await, JoinOutcome::Joined));

        // the reservation was used up
        assert!(conn.reserve_join().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_on_active_side_is_rejected() {
        let role = Role::Active { addr: "peer:1".to_string(), connector: Arc::new(MockConnector::new()) };
        let (conn, _stream, _peer) = established(role, quiet_config()).await;

        assert_eq!(conn.reserve_join().await.err(), Some(JoinStatus::UnknownConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_rejoin() {
        let (socket, remote) = socket_pair();
        let mut connector = MockConnector::new();
        connector.expect_connect()
            .times(1)
            .return_once(move |_| Ok(socket));

        let role = Role::Active { addr: "peer:1".to_string(), connector: Arc::new(connector) };
        let (conn, mut stream, mut peer) = established(role, quiet_config()).await;

        for i in 0..5u8 {
            stream.write_all(&[i]).await.unwrap();
            peer.recv().await;
        }
        peer.send(data(0)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));
        drop(peer);

        let mut peer = ScriptedPeer::new(remote);
        assert_eq!(peer.recv().await, Command::ReadyToJoin { identity: identity() });
        peer.send(Command::AckReadyToJoin { identity: identity() }).await;
        assert_eq!(peer.recv().await, Command::JoinConn { identity: identity() });
        peer.send(Command::AckJoinConn { status: JoinStatus::Accepted, identity: identity() }).await;
        peer.send(Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::from_raw(3), identity: identity() }).await;

        assert_eq!(peer.recv().await, Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::from_raw(1), identity: identity() });
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(3), payload: Bytes::from_static(&[3]) });
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(4), payload: Bytes::from_static(&[4]) });
        peer.expect_silence().await;

        wait_for_state(&conn, ConnectionState::Established).await;
        assert_eq!(conn.current_generation().await, Some(2));
        assert_eq!(conn.num_pending_packets().await, 5);

        // the rebound socket is fully usable
        stream.write_all(&[5]).await.unwrap();
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::from_raw(5), payload: Bytes::from_static(&[5]) });
        peer.send(data(1)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_rejoin_gives_up() {
        let mut connector = MockConnector::new();
        connector.expect_connect()
            .times(3)
            .returning(|_| Err(std::io::ErrorKind::ConnectionRefused.into()));

        let mut config = quiet_config();
        config.max_rejoin_attempts = 3;
        let role = Role::Active { addr: "peer:1".to_string(), connector: Arc::new(connector) };
        let (conn, mut stream, mut peer) = established(role, config).await;

        stream.write_all(b"lost").await.unwrap();
        peer.recv().await;
        drop(peer);

        match conn.wait_closed().await {
            Err(SessionError::RejoinTimeout { reason: DisconnectReason::AttemptsExhausted(3), .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(stream.write_all(b"x").await, Err(SessionError::RejoinTimeout { .. })));
        assert!(matches!(stream.read_chunk().await, Err(SessionError::RejoinTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_rejoin_peer_forgot_connection() {
        let (socket, remote) = socket_pair();
        let mut connector = MockConnector::new();
        connector.expect_connect()
            .times(1)
            .return_once(move |_| Ok(socket));

        let role = Role::Active { addr: "peer:1".to_string(), connector: Arc::new(connector) };
        let (conn, _stream, peer) = established(role, quiet_config()).await;
        drop(peer);

        let mut peer = ScriptedPeer::new(remote);
        assert_eq!(peer.recv().await, Command::ReadyToJoin { identity: identity() });
        peer.send(Command::AckJoinConn { status: JoinStatus::UnknownConnection, identity: identity() }).await;

        match conn.wait_closed().await {
            Err(SessionError::RejoinTimeout { reason: DisconnectReason::UnknownToPeer, .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_rejoin_timeout() {
        let mut config = quiet_config();
        config.passive_rejoin_timeout = Duration::from_secs(30);
        let (conn, _stream, peer) = established(Role::Passive, config).await;
        drop(peer);

        match conn.wait_closed().await {
            Err(SessionError::RejoinTimeout { reason: DisconnectReason::PassiveTimeout, .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_as_initiator() {
        let (conn, mut stream, mut peer) = established(Role::Passive, quiet_config()).await;

        stream.write_all(b"bye").await.unwrap();
        assert_eq!(peer.recv().await, Command::Data { packet_id: PacketId::ZERO, payload: Bytes::from_static(b"bye") });
        peer.send(data(0)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), Some(payload(0)));

        let closer = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close().await }
        });

        assert_eq!(peer.recv().await, Command::DataReceived { last_packet_received: PacketId::ZERO });
        assert_eq!(peer.recv().await, Command::ReadyToCloseConn { identity: identity() });
        assert!(matches!(stream.write_all(b"late").await, Err(SessionError::Closed)));

        peer.send(Command::AckReadyToCloseConn { identity: identity() }).await;
        assert_eq!(peer.recv().await, Command::CloseDataRequestNew { first_packet_to_resend: PacketId::from_raw(1) });
        peer.send(Command::AckCloseDataRequest { final_packet_id_sent_by_peer: Some(PacketId::ZERO), identity: identity() }).await;

        // "bye" is not acked yet
        peer.expect_silence().await;
        assert!(!closer.is_finished());

        peer.send(Command::DataReceived { last_packet_received: PacketId::ZERO }).await;
        assert_eq!(peer.recv().await, Command::CloseConn { identity: identity() });
        assert!(!closer.is_finished());

        peer.send(Command::AckCloseConn { identity: identity() }).await;
        closer.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(stream.read_chunk().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_as_responder() {
        let (conn, mut stream, mut peer) = established(Role::Passive, quiet_config()).await;

        stream.write_all(b"data").await.unwrap();
        peer.recv().await;

        peer.send(Command::ReadyToCloseConn { identity: identity() }).await;
        // our own packet is still pending
        peer.expect_silence().await;
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(matches!(stream.write_all(b"late").await, Err(SessionError::Closed)));

        peer.send(Command::DataReceived { last_packet_received: PacketId::ZERO }).await;
        assert_eq!(peer.recv().await, Command::AckReadyToCloseConn { identity: identity() });

        peer.send(Command::CloseDataRequestNew { first_packet_to_resend: PacketId::from_raw(1) }).await;
        assert_eq!(peer.recv().await, Command::AckCloseDataRequest { final_packet_id_sent_by_peer: Some(PacketId::ZERO), identity: identity() });

        peer.send(Command::CloseConn { identity: identity() }).await;
        assert_eq!(peer.recv().await, Command::AckCloseConn { identity: identity() });

        conn.wait_closed().await.unwrap();
        assert_eq!(stream.read_chunk().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_rejoin_pending() {
        let (conn, _stream, peer) = established(Role::Passive, quiet_config()).await;
        drop(peer);
        wait_for_state(&conn, ConnectionState::RejoinPending).await;

        timeout(Duration::from_secs(1), conn.close()).await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resumes_after_rejoin() {
        let (conn, _stream, mut peer) = established(Role::Passive, quiet_config()).await;

        let closer = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close().await }
        });
        assert_eq!(peer.recv().await, Command::ReadyToCloseConn { identity: identity() });
        drop(peer);
        wait_for_state(&conn, ConnectionState::RejoinPending).await;

        let (socket, remote) = socket_pair();
        assert!(matches!(conn.passive_join(socket, true, None).await, JoinOutcome::Joined));
        assert_eq!(conn.state(), ConnectionState::Closing);

        let mut peer = ScriptedPeer::new(remote);
        assert_eq!(peer.recv().await, Command::AckJoinCloseConn { status: JoinStatus::Accepted, identity: identity() });
        assert_eq!(peer.recv().await, Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::ZERO, identity: identity() });
        peer.send(Command::AckDataRequestOnReconnect { first_packet_id_req_to_send: PacketId::ZERO, identity: identity() }).await;

        // the unanswered close request is sent again
        assert_eq!(peer.recv().await, Command::ReadyToCloseConn { identity: identity() });
        peer.send(Command::AckReadyToCloseConn { identity: identity() }).await;
        assert_eq!(peer.recv().await, Command::CloseDataRequestNew { first_packet_to_resend: PacketId::ZERO });
        peer.send(Command::AckCloseDataRequest { final_packet_id_sent_by_peer: None, identity: identity() }).await;
        assert_eq!(peer.recv().await, Command::CloseConn { identity: identity() });
        peer.send(Command::AckCloseConn { identity: identity() }).await;

        closer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_mismatch_is_ignored() {
        let (conn, _stream, mut peer) = established(Role::Passive, quiet_config()).await;

        peer.send(Command::ReadyToCloseConn { identity: ConnectionIdentity::new("someone-else", 1) }).await;
        peer.expect_silence().await;
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framing_error_triggers_rejoin() {
        use tokio::io::AsyncWriteExt;

        let (conn, _stream, mut peer) = established(Role::Passive, quiet_config()).await;
        peer.stream.write_all(&[9,9,9,9, 0,1, 0,0,0,10]).await.unwrap();
        wait_for_state(&conn, ConnectionState::RejoinPending).await;
    }
}
