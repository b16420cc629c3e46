use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use crate::close::{CloseAction, CloseCoordinator, CloseView};
use crate::command::registry::CommandRegistry;
use crate::command::{Command, JoinStatus};
use crate::config::NonBreakingConfig;
use crate::connection::binding::{LossSource, PhysicalSocketBinding};
use crate::connection::receive_buffer::{ReceiveOutcome, ReceiveSequencer};
use crate::connection::send_buffer::PendingSendBuffer;
use crate::connection::{ConnectionState, LogicalConnection, Role};
use crate::error::{DisconnectReason, SessionError};
use crate::identity::ConnectionIdentity;
use crate::packet_id::PacketId;
use crate::reconnect;
use crate::transport::PhysicalSocket;

/// The state of one logical connection, always accessed through [LogicalConnection]'s lock.
///
/// All methods are synchronous: they update the state and hand frames to the current binding's
///  writer task, so a cancelled caller can never leave the brain half-updated.
pub struct Brain {
    identity: ConnectionIdentity,
    role: Role,
    config: Arc<NonBreakingConfig>,
    commands: CommandRegistry,
    myself: Weak<LogicalConnection>,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,

    send_buffer: PendingSendBuffer,
    /// one permit per packet that may still be registered in the send buffer
    send_permits: Arc<Semaphore>,
    receiver: ReceiveSequencer,
    /// dropped when the connection is closed, which ends the application's read stream
    app_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// number of delivered packets the application took out of `app_tx`. Only those are acked
    ///  while the connection is open, so a peer writing to a reader that does not read runs out
    ///  of send window.
    app_consumed: Arc<AtomicU64>,

    binding: Option<PhysicalSocketBinding>,
    last_generation: u64,
    /// Passive side after a rejoin: frames are held back until the peer told us its receive cursor
    ///  through `AckDataRequestOnReconnect`
    resync_pending: bool,
    join_reservation: Option<u64>,
    last_join_reservation: u64,
    /// the active rejoin loop or the passive side's rejoin timeout
    rejoin_task: Option<AbortHandle>,

    close: CloseCoordinator,
    last_ack_sent: Option<PacketId>,

    disconnect_reason: Option<DisconnectReason>,
    deregister: bool,
}

impl Brain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: ConnectionIdentity,
        role: Role,
        config: Arc<NonBreakingConfig>,
        commands: CommandRegistry,
        myself: Weak<LogicalConnection>,
        state_tx: watch::Sender<ConnectionState>,
        send_permits: Arc<Semaphore>,
        app_tx: mpsc::UnboundedSender<Bytes>,
        app_consumed: Arc<AtomicU64>,
    ) -> Brain {
        let receiver = ReceiveSequencer::new(config.max_out_of_order_packets);
        Brain {
            identity,
            role,
            config,
            commands,
            myself,
            state: ConnectionState::Opening,
            state_tx,
            send_buffer: PendingSendBuffer::new(),
            send_permits,
            receiver,
            app_tx: Some(app_tx),
            app_consumed,
            binding: None,
            last_generation: 0,
            resync_pending: false,
            join_reservation: None,
            last_join_reservation: 0,
            rejoin_task: None,
            close: CloseCoordinator::new(),
            last_ack_sent: None,
            disconnect_reason: None,
            deregister: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_closing()
    }

    pub fn num_pending_packets(&self) -> usize {
        self.send_buffer.len()
    }

    pub fn receive_cursor(&self) -> PacketId {
        self.receiver.cursor()
    }

    /// Number of distinct `Data` packets registered for sending so far, resends not counted
    pub fn num_packets_sent(&self) -> u32 {
        self.send_buffer.next_packet_id().to_raw()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.binding.as_ref().map(|b| b.generation())
    }

    /// The error that ended the connection, `None` while it is open or if it was closed gracefully
    pub fn terminal_error(&self) -> Option<SessionError> {
        self.disconnect_reason.map(|reason| SessionError::RejoinTimeout {
            identity: self.identity.clone(),
            reason,
        })
    }

    /// `true` once after the connection was closed: it must be removed from the node's registry
    pub fn take_deregister(&mut self) -> bool {
        std::mem::take(&mut self.deregister)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{}: {:?} -> {:?}", self.identity, self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn state_after_rebind(&self) -> ConnectionState {
        if self.close.is_closing() {
            ConnectionState::Closing
        }
        else {
            ConnectionState::Established
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == Some(generation)
    }

    fn can_transmit(&self) -> bool {
        self.binding.is_some() && !self.resync_pending
    }

    fn send_frame(&self, command: Command) {
        if let Some(binding) = &self.binding {
            binding.send(command);
        }
    }

    /// Binds a new physical socket, superseding the current one if there is one
    fn bind(&mut self, socket: PhysicalSocket) {
        if let Some(old) = self.binding.take() {
            old.supersede();
        }

        self.last_generation += 1;
        debug!("{}: binding physical socket to {} as generation {}", self.identity, socket.peer, self.last_generation);
        self.binding = Some(PhysicalSocketBinding::spawn(
            socket,
            self.last_generation,
            &self.identity,
            self.myself.clone(),
            self.commands.clone(),
            self.config.max_frame_len,
            self.config.link_idle_timeout,
        ));
        self.receiver.forget_outstanding_request();
        // the last ack may have been lost with the old socket
        self.last_ack_sent = None;
    }

    /// Initial binding after a successful `NewConn` handshake. `first_frame` is sent before
    ///  anything else on the new socket.
    pub fn establish(&mut self, socket: PhysicalSocket, first_frame: Option<Command>) {
        if self.state != ConnectionState::Opening {
            warn!("{}: establishing a connection in state {:?} - ignoring", self.identity, self.state);
            return;
        }

        self.bind(socket);
        if let Some(command) = first_frame {
            self.send_frame(command);
        }
        self.set_state(ConnectionState::Established);
    }

    /// The handshake for a new connection failed
    pub fn fail_open(&mut self) {
        if self.state == ConnectionState::Opening {
            debug!("{}: opening failed", self.identity);
            self.finish(None);
        }
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        if self.state == ConnectionState::Closed || self.close.is_closing() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Registers the payload in the pending-send buffer and transmits it if a physical socket is
    ///  usable. The caller holds a send window permit for it.
    pub fn send_data(&mut self, payload: Bytes) -> Result<(), SessionError> {
        self.check_writable()?;

        let Some(packet_id) = self.send_buffer.register(payload.clone()) else {
            return Err(SessionError::ProtocolViolation(format!("packet id space of {} is exhausted", self.identity)));
        };
        trace!("registered packet {} with {} bytes", packet_id, payload.len());

        if self.can_transmit() {
            self.send_frame(Command::Data { packet_id, payload });
        }
        Ok(())
    }

    /// Dispatches a frame received on the binding with the given generation. Returns `false` if
    ///  the reader should stop.
    pub fn on_command(&mut self, generation: u64, command: Command) -> bool {
        if !self.is_current(generation) {
            trace!("ignoring {:?} from superseded binding {}", command.id(), generation);
            return false;
        }

        if let Some(identity) = command.identity() {
            if identity != &self.identity {
                warn!("{}: received {:?} for {} - ignoring", self.identity, command.id(), identity);
                return true;
            }
        }

        match command {
            Command::Data { packet_id, payload } => self.on_data(packet_id, payload),
            Command::DataReceived { last_packet_received } => self.on_data_received(last_packet_received),
            Command::DataRequest { first_packet_to_resend } => {
                debug!("{}: peer requested resend from {}", self.identity, first_packet_to_resend);
                self.retransmit_from(first_packet_to_resend);
            }
            Command::AckDataRequestOnReconnect { first_packet_id_req_to_send, .. } => self.on_peer_resync(first_packet_id_req_to_send),
            Command::ReadyToCloseConn { .. } => {
                debug!("{}: peer requested close", self.identity);
                self.close.on_peer_requested();
                self.set_state(ConnectionState::Closing);
            }
            Command::AckReadyToCloseConn { .. } => self.close.on_peer_ready_acked(),
            Command::CloseDataRequestNew { first_packet_to_resend } => {
                self.retransmit_from(first_packet_to_resend);
                self.send_frame(Command::AckCloseDataRequest {
                    final_packet_id_sent_by_peer: self.send_buffer.last_registered(),
                    identity: self.identity.clone(),
                });
            }
            Command::AckCloseDataRequest { final_packet_id_sent_by_peer, .. } => self.close.on_peer_final(final_packet_id_sent_by_peer),
            Command::CloseConn { .. } => self.close.on_peer_close(),
            Command::AckCloseConn { .. } => {
                if self.close.is_local_part_complete() {
                    self.close.on_close_acked();
                }
                else {
                    warn!("{}: AckCloseConn although no CloseConn was sent - ignoring", self.identity);
                }
            }
            other => {
                warn!("{}: unexpected {:?} on an established physical socket - ignoring", self.identity, other.id());
            }
        }

        self.drive_close();
        self.state != ConnectionState::Closed
    }

    fn on_data(&mut self, packet_id: PacketId, payload: Bytes) {
        if self.state == ConnectionState::Closed {
            warn!("{}: data packet {} for a closed connection - ignoring", self.identity, packet_id);
            return;
        }

        match self.receiver.on_data(packet_id, payload) {
            ReceiveOutcome::Delivered(payloads) => {
                if let Some(app_tx) = &self.app_tx {
                    for payload in payloads {
                        if app_tx.send(payload).is_err() {
                            // nobody will ever consume it, so it must not hold back the peer
                            trace!("application dropped its read stream - discarding data");
                            self.app_consumed.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                }

                if self.close.is_closing() {
                    self.send_ack();
                }
            }
            ReceiveOutcome::Gap { request_resend_from: Some(first) } => {
                debug!("{}: gap before packet {} - requesting resend from {}", self.identity, packet_id, first);
                self.send_frame(Command::DataRequest { first_packet_to_resend: first });
            }
            ReceiveOutcome::Gap { request_resend_from: None } |
            ReceiveOutcome::Duplicate => {}
        }
    }

    /// The highest packet id that may be acked. Delivered packets have consecutive ids starting
    ///  at zero, so the application consumed exactly the ids below its consumed count. Closing
    ///  acks everything that was received: the close handshake waits for it.
    fn ackable(&self) -> Option<PacketId> {
        let last_received = self.receiver.last_received()?;
        if self.close.is_closing() {
            return Some(last_received);
        }

        let consumed = self.app_consumed.load(Ordering::Acquire);
        let last_consumed = consumed.checked_sub(1)?;
        let last_consumed = PacketId::from_raw(last_consumed.min(u32::MAX as u64) as u32);
        Some(last_received.min(last_consumed))
    }

    fn send_ack(&mut self) {
        let Some(ackable) = self.ackable() else {
            return;
        };
        if self.binding.is_none() || self.last_ack_sent.map_or(false, |sent| sent >= ackable) {
            return;
        }

        self.send_frame(Command::DataReceived { last_packet_received: ackable });
        self.last_ack_sent = Some(ackable);
    }

    /// Periodic ack; returns `false` once the connection is closed
    pub fn flush_ack(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.send_ack();
        true
    }

    /// The application consumed another batch of received packets
    pub fn on_app_progress(&mut self) {
        if self.state != ConnectionState::Closed {
            self.send_ack();
        }
    }

    /// Traffic for an otherwise idle physical socket, so that the peer's idle timeout does not
    ///  fire and a dead link is noticed by the writer. Repeats the last ack, which the peer treats
    ///  as a no-op, or asks for a resend from the current cursor if nothing was acked yet.
    ///  Returns `false` once the connection is closed.
    pub fn send_keepalive(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        if !self.can_transmit() {
            return true;
        }

        let command = match self.last_ack_sent {
            Some(last_packet_received) => Command::DataReceived { last_packet_received },
            None => Command::DataRequest { first_packet_to_resend: self.receiver.cursor() },
        };
        trace!("{}: keepalive {:?}", self.identity, command.id());
        self.send_frame(command);
        true
    }

    fn on_data_received(&mut self, last_received: PacketId) {
        let num_purged = self.send_buffer.on_cumulative_ack(last_received);
        self.send_permits.add_permits(num_purged);
    }

    /// Everything from `first` on is sent again. Shared by `DataRequest`, `CloseDataRequestNew` and
    ///  the resync after a rejoin. Packets below `first` stay pending until the peer's cumulative
    ///  ack covers them: the peer received them, but its application may not have consumed them.
    fn retransmit_from(&mut self, first: PacketId) {
        if first > self.send_buffer.next_packet_id() {
            warn!("{}: peer requested resend from {}, but only packets below {} were sent", self.identity, first, self.send_buffer.next_packet_id());
        }

        if let Some(binding) = &self.binding {
            let mut num_resent = 0;
            for (packet_id, payload) in self.send_buffer.resend_from(first) {
                binding.send(Command::Data { packet_id, payload: payload.clone() });
                num_resent += 1;
            }
            if num_resent > 0 {
                debug!("{}: resent {} packets from {}", self.identity, num_resent, first);
            }
        }
    }

    fn on_peer_resync(&mut self, first: PacketId) {
        let was_pending = std::mem::take(&mut self.resync_pending);
        if !was_pending {
            debug!("{}: AckDataRequestOnReconnect without a pending resync - treating it as a resend request", self.identity);
        }

        self.retransmit_from(first);
        if was_pending {
            self.redrive_close();
        }
    }

    fn close_frame(&self, action: CloseAction) -> Command {
        let identity = self.identity.clone();
        match action {
            CloseAction::SendReadyToClose => Command::ReadyToCloseConn { identity },
            CloseAction::SendAckReadyToClose => Command::AckReadyToCloseConn { identity },
            CloseAction::SendCloseDataRequest => Command::CloseDataRequestNew { first_packet_to_resend: self.receiver.cursor() },
            CloseAction::SendCloseConn => Command::CloseConn { identity },
            CloseAction::SendAckCloseConn => Command::AckCloseConn { identity },
        }
    }

    fn drive_close(&mut self) {
        if !self.close.is_closing() || !self.can_transmit() || self.state == ConnectionState::Closed {
            return;
        }

        // the peer can only become ready once everything it sent was acked
        self.send_ack();

        let view = CloseView {
            send_buffer_empty: self.send_buffer.is_empty(),
            last_received: self.receiver.last_received(),
        };
        for action in self.close.poll(&view) {
            trace!("{}: close protocol: {:?}", self.identity, action);
            self.send_frame(self.close_frame(action));
        }

        if self.close.is_finished() {
            self.finish(None);
        }
    }

    fn redrive_close(&mut self) {
        for action in self.close.redrive() {
            debug!("{}: re-sending {:?} after rejoin", self.identity, action);
            self.send_frame(self.close_frame(action));
        }
    }

    /// Local close request. While a rejoin is pending and nothing is waiting to be sent, this
    ///  cancels the rejoin and closes immediately.
    pub fn request_close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.close.request_local() {
            debug!("{}: close requested locally", self.identity);
        }

        match self.state {
            ConnectionState::RejoinPending if self.send_buffer.is_empty() => {
                debug!("{}: closing while rejoin is pending - cancelling the rejoin", self.identity);
                self.finish(None);
                return;
            }
            ConnectionState::Established => self.set_state(ConnectionState::Closing),
            _ => {}
        }
        self.drive_close();
    }

    /// The physical socket of the given generation broke
    pub fn on_socket_lost(&mut self, generation: u64, source: LossSource, err: &SessionError) {
        if !self.is_current(generation) {
            trace!("ignoring loss of superseded binding {}: {}", generation, err);
            return;
        }
        let Some(binding) = self.binding.take() else {
            return;
        };
        info!("{}: lost physical socket to {} (generation {}): {}", self.identity, binding.peer(), generation, err);
        binding.on_loss(source);

        if self.state == ConnectionState::Closed {
            return;
        }
        self.resync_pending = false;
        self.set_state(ConnectionState::RejoinPending);

        if self.rejoin_task.is_some() {
            return;
        }
        let Some(conn) = self.myself.upgrade() else {
            return;
        };
        let task = match &self.role {
            Role::Active { addr, connector } => reconnect::spawn_active_rejoin(conn, connector.clone(), addr.clone()),
            Role::Passive => reconnect::spawn_passive_timeout(conn, self.config.passive_rejoin_timeout),
        };
        self.rejoin_task = Some(task.abort_handle());
    }

    /// Last step of an active rejoin: the peer accepted the join and reported its receive cursor.
    ///  Returns `false` if the connection was closed in the meantime.
    pub fn complete_active_rejoin(&mut self, socket: PhysicalSocket, peer_cursor: PacketId) -> bool {
        // called from the rejoin task itself, which terminates afterwards
        self.rejoin_task = None;
        if self.state == ConnectionState::Closed {
            return false;
        }

        self.bind(socket);
        let cursor = self.receiver.cursor();
        self.send_frame(Command::AckDataRequestOnReconnect {
            first_packet_id_req_to_send: cursor,
            identity: self.identity.clone(),
        });
        self.receiver.on_resend_requested(cursor);

        self.resync_pending = false;
        self.set_state(self.state_after_rebind());

        self.retransmit_from(peer_cursor);
        self.redrive_close();
        self.drive_close();
        true
    }

    pub fn join_status(&self, reservation: Option<u64>) -> JoinStatus {
        if self.state == ConnectionState::Closed {
            return JoinStatus::AlreadyClosed;
        }
        if self.state == ConnectionState::Opening || matches!(self.role, Role::Active { .. }) {
            return JoinStatus::UnknownConnection;
        }
        match self.join_reservation {
            Some(r) if Some(r) != reservation => JoinStatus::Busy,
            _ => JoinStatus::Accepted,
        }
    }

    /// A `ReadyToJoin` reserves the connection for the physical socket it came through
    pub fn reserve_join(&mut self) -> Result<u64, JoinStatus> {
        match self.join_status(None) {
            JoinStatus::Accepted => {
                self.last_join_reservation += 1;
                self.join_reservation = Some(self.last_join_reservation);
                Ok(self.last_join_reservation)
            }
            status => Err(status),
        }
    }

    pub fn release_join(&mut self, reservation: u64) {
        if self.join_reservation == Some(reservation) {
            self.join_reservation = None;
        }
    }

    /// Passive side of a rejoin. The caller checked [Brain::join_status].
    pub fn complete_passive_join(&mut self, socket: PhysicalSocket, join_close: bool) {
        if let Some(timeout) = self.rejoin_task.take() {
            timeout.abort();
        }
        self.join_reservation = None;

        self.bind(socket);
        let identity = self.identity.clone();
        self.send_frame(if join_close {
            Command::AckJoinCloseConn { status: JoinStatus::Accepted, identity: identity.clone() }
        }
        else {
            Command::AckJoinConn { status: JoinStatus::Accepted, identity: identity.clone() }
        });

        let cursor = self.receiver.cursor();
        self.send_frame(Command::AckDataRequestOnReconnect {
            first_packet_id_req_to_send: cursor,
            identity,
        });
        self.receiver.on_resend_requested(cursor);

        self.resync_pending = true;
        self.set_state(self.state_after_rebind());
    }

    /// Rejoining failed for good (or the peer does not know the connection any more). Called
    ///  by the rejoin task or the passive timeout task.
    pub fn abandon(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Closed || self.binding.is_some() {
            return;
        }
        self.rejoin_task = None;

        if self.close.is_local_part_complete() {
            info!("{}: peer is gone after CloseConn was sent - considering the close complete", self.identity);
            self.finish(None);
        }
        else {
            self.finish(Some(reason));
        }
    }

    fn finish(&mut self, reason: Option<DisconnectReason>) {
        if self.state == ConnectionState::Closed {
            return;
        }

        match reason {
            None => {
                debug_assert!(self.send_buffer.is_empty());
                info!("{}: closed", self.identity);
            }
            Some(reason) => {
                warn!("{}: giving up connection: {}", self.identity, reason);
                self.send_buffer.clear();
            }
        }
        self.disconnect_reason = reason;

        if let Some(binding) = self.binding.take() {
            binding.finish();
        }
        if let Some(task) = self.rejoin_task.take() {
            task.abort();
        }
        self.join_reservation = None;
        self.resync_pending = false;
        self.app_tx = None;
        self.send_permits.close();

        self.set_state(ConnectionState::Closed);
        self.deregister = true;
    }
}
