//! Rejoining a logical connection on a new physical socket after the old one broke.
//!
//! The active side (the one that opened the connection) redials and runs the join handshake:
//!
//! ```ascii
//! active                                     passive
//!   ReadyToJoin                 ->
//!                               <-  AckReadyToJoin   (or AckJoinConn with a rejection status)
//!   JoinConn / JoinCloseConn    ->
//!                               <-  AckJoinConn / AckJoinCloseConn
//!                               <-  AckDataRequestOnReconnect(passive cursor)
//!   AckDataRequestOnReconnect(active cursor) ->
//!   ... both sides resend everything from the other side's cursor on
//! ```
//!
//! The passive side accepts `JoinConn` without a preceding `ReadyToJoin` as well. A join never
//!  creates a connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use crate::command::frame_io::{read_frame_within, write_frame};
use crate::command::registry::CommandRegistry;
use crate::command::{Command, JoinStatus};
use crate::config::NonBreakingConfig;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::{JoinOutcome, LogicalConnection};
use crate::error::{DisconnectReason, SessionError};
use crate::identity::ConnectionIdentity;
use crate::transport::{Connector, PhysicalSocket};
use crate::util::backoff::ExponentialBackoff;

#[derive(Debug, Eq, PartialEq)]
enum AttemptOutcome {
    Rejoined,
    /// another join for the same connection is in progress on the peer - try again later
    Busy,
    /// the peer does not know the connection (any more)
    Forgotten(JoinStatus),
}

pub(crate) fn spawn_active_rejoin(conn: Arc<LogicalConnection>, connector: Arc<dyn Connector>, addr: String) -> JoinHandle<()> {
    let span = info_span!("rejoin", identity = %conn.identity(), %addr);
    tokio::spawn(run_active_rejoin(conn, connector, addr).instrument(span))
}

async fn run_active_rejoin(conn: Arc<LogicalConnection>, connector: Arc<dyn Connector>, addr: String) {
    let max_attempts = conn.config().max_rejoin_attempts;
    let mut backoff = ExponentialBackoff::new(conn.config());

    for attempt in 1..=max_attempts {
        match try_rejoin(&conn, connector.as_ref(), &addr).await {
            Ok(AttemptOutcome::Rejoined) => {
                info!("rejoined after {} attempt(s)", attempt);
                return;
            }
            Ok(AttemptOutcome::Forgotten(status)) => {
                warn!("peer rejected the rejoin: {:?}", status);
                conn.abandon(DisconnectReason::UnknownToPeer).await;
                return;
            }
            Ok(AttemptOutcome::Busy) => debug!("attempt {}: peer is busy with another join", attempt),
            Err(e) => debug!("attempt {} failed: {}", attempt, e),
        }

        if attempt < max_attempts {
            let delay = backoff.next_delay_with_jitter();
            trace!("next rejoin attempt in {:?}", delay);
            sleep(delay).await;
        }
    }

    conn.abandon(DisconnectReason::AttemptsExhausted(max_attempts)).await;
}

async fn try_rejoin(conn: &LogicalConnection, connector: &dyn Connector, addr: &str) -> Result<AttemptOutcome, SessionError> {
    let config = conn.config();
    let commands = conn.commands();
    let identity = conn.identity().clone();

    let mut socket = match timeout(config.connect_timeout, connector.connect(addr)).await {
        Ok(socket) => socket?,
        Err(_) => return Err(SessionError::HandshakeTimeout),
    };

    write_frame(&mut socket.writer, &Command::ReadyToJoin { identity: identity.clone() }).await?;
    match read_frame_within(&mut socket.reader, commands, config.max_frame_len, config.handshake_timeout).await? {
        Command::AckReadyToJoin { identity: acked } if acked == identity => {}
        Command::AckJoinConn { status, identity: acked } if acked == identity => return rejection(status),
        other => return Err(unexpected(&other)),
    }

    let join = if conn.is_closing().await {
        Command::JoinCloseConn { identity: identity.clone() }
    }
    else {
        Command::JoinConn { identity: identity.clone() }
    };
    write_frame(&mut socket.writer, &join).await?;

    match read_frame_within(&mut socket.reader, commands, config.max_frame_len, config.handshake_timeout).await? {
        Command::AckJoinConn { status, identity: acked } |
        Command::AckJoinCloseConn { status, identity: acked } if acked == identity => {
            if status != JoinStatus::Accepted {
                return rejection(status);
            }
        }
        other => return Err(unexpected(&other)),
    }

    let peer_cursor = match read_frame_within(&mut socket.reader, commands, config.max_frame_len, config.handshake_timeout).await? {
        Command::AckDataRequestOnReconnect { first_packet_id_req_to_send, identity: acked } if acked == identity => first_packet_id_req_to_send,
        other => return Err(unexpected(&other)),
    };

    if !conn.complete_active_rejoin(socket, peer_cursor).await {
        debug!("connection was closed while rejoining - discarding the new physical socket");
    }
    Ok(AttemptOutcome::Rejoined)
}

fn rejection(status: JoinStatus) -> Result<AttemptOutcome, SessionError> {
    match status {
        JoinStatus::Busy => Ok(AttemptOutcome::Busy),
        JoinStatus::UnknownConnection | JoinStatus::AlreadyClosed => Ok(AttemptOutcome::Forgotten(status)),
        JoinStatus::Accepted => Err(SessionError::ProtocolViolation("join ack with status 'accepted' in answer to ReadyToJoin".to_string())),
    }
}

fn unexpected(command: &Command) -> SessionError {
    SessionError::ProtocolViolation(format!("unexpected {:?} during join handshake", command.id()))
}

pub(crate) fn spawn_passive_timeout(conn: Arc<LogicalConnection>, rejoin_timeout: Duration) -> JoinHandle<()> {
    let span = info_span!("awaiting rejoin", identity = %conn.identity());
    tokio::spawn(async move {
        sleep(rejoin_timeout).await;
        debug!("peer did not rejoin within {:?}", rejoin_timeout);
        conn.abandon(DisconnectReason::PassiveTimeout).await;
    }.instrument(span))
}

/// Passive side: the first frame on an inbound physical socket was `ReadyToJoin`
pub(crate) async fn on_ready_to_join(
    registry: &ConnectionRegistry,
    mut socket: PhysicalSocket,
    identity: ConnectionIdentity,
    config: &NonBreakingConfig,
    commands: &CommandRegistry,
) -> Result<(), SessionError> {
    let Some(conn) = registry.get(&identity).await else {
        return reject(socket, JoinStatus::UnknownConnection, identity, false).await;
    };
    let reservation = match conn.reserve_join().await {
        Ok(reservation) => reservation,
        Err(status) => return reject(socket, status, identity, false).await,
    };

    let handshake = async {
        write_frame(&mut socket.writer, &Command::AckReadyToJoin { identity: identity.clone() }).await?;
        match read_frame_within(&mut socket.reader, commands, config.max_frame_len, config.handshake_timeout).await? {
            Command::JoinConn { identity: joining } if joining == identity => Ok(false),
            Command::JoinCloseConn { identity: joining } if joining == identity => Ok(true),
            other => Err(unexpected(&other)),
        }
    }.await;

    match handshake {
        Ok(join_close) => complete_join(&conn, socket, identity, join_close, Some(reservation)).await,
        Err(e) => {
            conn.release_join(reservation).await;
            Err(e)
        }
    }
}

/// Passive side: the first frame on an inbound physical socket was `JoinConn` or `JoinCloseConn`
pub(crate) async fn on_join(registry: &ConnectionRegistry, socket: PhysicalSocket, identity: ConnectionIdentity, join_close: bool) -> Result<(), SessionError> {
    match registry.get(&identity).await {
        Some(conn) => complete_join(&conn, socket, identity, join_close, None).await,
        None => reject(socket, JoinStatus::UnknownConnection, identity, join_close).await,
    }
}

async fn complete_join(conn: &LogicalConnection, socket: PhysicalSocket, identity: ConnectionIdentity, join_close: bool, reservation: Option<u64>) -> Result<(), SessionError> {
    if join_close {
        debug!("peer is rejoining {} while closing", identity);
    }

    match conn.passive_join(socket, join_close, reservation).await {
        JoinOutcome::Joined => {
            info!("{} rejoined", identity);
            Ok(())
        }
        JoinOutcome::Rejected(status, socket) => reject(socket, status, identity, join_close).await,
    }
}

async fn reject(mut socket: PhysicalSocket, status: JoinStatus, identity: ConnectionIdentity, join_close: bool) -> Result<(), SessionError> {
    debug!("rejecting join for {} from {}: {:?}", identity, socket.peer, status);

    let reply = if join_close {
        Command::AckJoinCloseConn { status, identity }
    }
    else {
        Command::AckJoinConn { status, identity }
    };
    write_frame(&mut socket.writer, &reply).await?;
    socket.writer.shutdown().await?;
    Ok(())
}
