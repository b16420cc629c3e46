//! The wire format of the session protocol.
//!
//! Every frame has the following layout, all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: magic number 0x14 0x25 0x36 0x47
//! 4: command id (u16)
//! 6: total frame length including this header (u32)
//! 10: command specific payload
//! ```
//!
//! Strings are encoded as their byte length (u32) followed by UTF-8 bytes, integers as u32.
//!
//! A physical socket carries frames for exactly one logical connection. The first frame on a
//!  socket identifies the connection (`NewConn`, `ReadyToJoin`, `JoinConn` or `JoinCloseConn`),
//!  all subsequent frames are dispatched to that connection. Frames carrying an identity are checked
//!  against the socket's connection.

pub mod frame_io;
pub mod registry;

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::identity::ConnectionIdentity;
use crate::packet_id::PacketId;
use crate::util::buf::put_string;
use crate::util::safe_converter::PrecheckedCast;

pub const FRAME_MAGIC: [u8; 4] = [0x14, 0x25, 0x36, 0x47];
pub const FRAME_HEADER_LEN: usize = 4 + 2 + 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CommandId {
    Data = 1,
    NewConn = 2,
    AckNewConn = 3,
    DataReceived = 4,
    JoinConn = 5,
    CloseConn = 6,
    DataRequest = 7,
    AckCloseConn = 8,
    JoinCloseConn = 9,
    CloseDataRequestNew = 10,
    ReadyToCloseConn = 11,
    AckJoinConn = 12,
    AckJoinCloseConn = 15,
    AckDataRequestOnReconnect = 16,
    AckReadyToCloseConn = 17,
    AckCloseDataRequest = 18,
    ReadyToJoin = 19,
    AckReadyToJoin = 20,
}

impl CommandId {
    pub const ALL: [CommandId; 18] = [
        CommandId::Data,
        CommandId::NewConn,
        CommandId::AckNewConn,
        CommandId::DataReceived,
        CommandId::JoinConn,
        CommandId::CloseConn,
        CommandId::DataRequest,
        CommandId::AckCloseConn,
        CommandId::JoinCloseConn,
        CommandId::CloseDataRequestNew,
        CommandId::ReadyToCloseConn,
        CommandId::AckJoinConn,
        CommandId::AckJoinCloseConn,
        CommandId::AckDataRequestOnReconnect,
        CommandId::AckReadyToCloseConn,
        CommandId::AckCloseDataRequest,
        CommandId::ReadyToJoin,
        CommandId::AckReadyToJoin,
    ];
}

/// The `intParam` of `AckJoinConn` / `AckJoinCloseConn`
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum JoinStatus {
    Accepted = 0,
    UnknownConnection = 1,
    /// another join for the same connection is in flight
    Busy = 2,
    AlreadyClosed = 3,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Data {
        packet_id: PacketId,
        payload: Bytes,
    },
    NewConn {
        identity: ConnectionIdentity,
        connector_ip: String,
        server_port: u32,
    },
    AckNewConn {
        identity: ConnectionIdentity,
        connector_ip: String,
        server_port: u32,
    },
    /// cumulative ack: all packets up to and including this id were received
    DataReceived {
        last_packet_received: PacketId,
    },
    JoinConn {
        identity: ConnectionIdentity,
    },
    CloseConn {
        identity: ConnectionIdentity,
    },
    /// the receiver's cursor: everything below was received, everything from here on is requested
    DataRequest {
        first_packet_to_resend: PacketId,
    },
    AckCloseConn {
        identity: ConnectionIdentity,
    },
    JoinCloseConn {
        identity: ConnectionIdentity,
    },
    CloseDataRequestNew {
        first_packet_to_resend: PacketId,
    },
    ReadyToCloseConn {
        identity: ConnectionIdentity,
    },
    AckJoinConn {
        status: JoinStatus,
        identity: ConnectionIdentity,
    },
    AckJoinCloseConn {
        status: JoinStatus,
        identity: ConnectionIdentity,
    },
    AckDataRequestOnReconnect {
        first_packet_id_req_to_send: PacketId,
        identity: ConnectionIdentity,
    },
    AckReadyToCloseConn {
        identity: ConnectionIdentity,
    },
    /// `None` if the peer never sent a data packet on this connection
    AckCloseDataRequest {
        final_packet_id_sent_by_peer: Option<PacketId>,
        identity: ConnectionIdentity,
    },
    ReadyToJoin {
        identity: ConnectionIdentity,
    },
    AckReadyToJoin {
        identity: ConnectionIdentity,
    },
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Data { .. } => CommandId::Data,
            Command::NewConn { .. } => CommandId::NewConn,
            Command::AckNewConn { .. } => CommandId::AckNewConn,
            Command::DataReceived { .. } => CommandId::DataReceived,
            Command::JoinConn { .. } => CommandId::JoinConn,
            Command::CloseConn { .. } => CommandId::CloseConn,
            Command::DataRequest { .. } => CommandId::DataRequest,
            Command::AckCloseConn { .. } => CommandId::AckCloseConn,
            Command::JoinCloseConn { .. } => CommandId::JoinCloseConn,
            Command::CloseDataRequestNew { .. } => CommandId::CloseDataRequestNew,
            Command::ReadyToCloseConn { .. } => CommandId::ReadyToCloseConn,
            Command::AckJoinConn { .. } => CommandId::AckJoinConn,
            Command::AckJoinCloseConn { .. } => CommandId::AckJoinCloseConn,
            Command::AckDataRequestOnReconnect { .. } => CommandId::AckDataRequestOnReconnect,
            Command::AckReadyToCloseConn { .. } => CommandId::AckReadyToCloseConn,
            Command::AckCloseDataRequest { .. } => CommandId::AckCloseDataRequest,
            Command::ReadyToJoin { .. } => CommandId::ReadyToJoin,
            Command::AckReadyToJoin { .. } => CommandId::AckReadyToJoin,
        }
    }

    /// The identity carried in the frame, if the frame type has one
    pub fn identity(&self) -> Option<&ConnectionIdentity> {
        match self {
            Command::Data { .. } |
            Command::DataReceived { .. } |
            Command::DataRequest { .. } |
            Command::CloseDataRequestNew { .. } => None,

            Command::NewConn { identity, .. } |
            Command::AckNewConn { identity, .. } |
            Command::JoinConn { identity } |
            Command::CloseConn { identity } |
            Command::AckCloseConn { identity } |
            Command::JoinCloseConn { identity } |
            Command::ReadyToCloseConn { identity } |
            Command::AckJoinConn { identity, .. } |
            Command::AckJoinCloseConn { identity, .. } |
            Command::AckDataRequestOnReconnect { identity, .. } |
            Command::AckReadyToCloseConn { identity } |
            Command::AckCloseDataRequest { identity, .. } |
            Command::ReadyToJoin { identity } |
            Command::AckReadyToJoin { identity } => Some(identity),
        }
    }

    /// Appends the complete frame (header and payload) to the buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16(self.id().into());
        buf.put_u32(0); // placeholder for the total length, patched below

        self.ser_payload(buf);

        let total_len: u32 = (buf.len() - start).prechecked_cast();
        buf[start+6..start+FRAME_HEADER_LEN].copy_from_slice(&total_len.to_be_bytes());
    }

    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 32);
        self.encode(&mut buf);
        buf.freeze()
    }

    fn ser_payload(&self, buf: &mut BytesMut) {
        match self {
            Command::Data { packet_id, payload } => {
                buf.put_u32(packet_id.to_raw());
                buf.put_u32(payload.len().prechecked_cast());
                buf.put_slice(payload);
            }
            Command::NewConn { identity, connector_ip, server_port } |
            Command::AckNewConn { identity, connector_ip, server_port } => {
                identity.ser(buf);
                put_string(buf, connector_ip);
                buf.put_u32(*server_port);
            }
            Command::DataReceived { last_packet_received } => {
                buf.put_u32(last_packet_received.to_raw());
            }
            Command::DataRequest { first_packet_to_resend } |
            Command::CloseDataRequestNew { first_packet_to_resend } => {
                buf.put_u32(first_packet_to_resend.to_raw());
            }
            Command::JoinConn { identity } |
            Command::CloseConn { identity } |
            Command::AckCloseConn { identity } |
            Command::JoinCloseConn { identity } |
            Command::ReadyToCloseConn { identity } |
            Command::AckReadyToCloseConn { identity } |
            Command::ReadyToJoin { identity } |
            Command::AckReadyToJoin { identity } => {
                identity.ser(buf);
            }
            Command::AckJoinConn { status, identity } |
            Command::AckJoinCloseConn { status, identity } => {
                buf.put_u32((*status).into());
                identity.ser(buf);
            }
            Command::AckDataRequestOnReconnect { first_packet_id_req_to_send, identity } => {
                buf.put_u32(first_packet_id_req_to_send.to_raw());
                identity.ser(buf);
            }
            Command::AckCloseDataRequest { final_packet_id_sent_by_peer, identity } => {
                buf.put_u32(PacketId::to_wire_opt(*final_packet_id_sent_by_peer));
                identity.ser(buf);
            }
        }
    }
}
