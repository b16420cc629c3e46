use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::command::{Command, CommandId, JoinStatus, FRAME_HEADER_LEN, FRAME_MAGIC};
use crate::error::SessionError;
use crate::identity::ConnectionIdentity;
use crate::packet_id::PacketId;
use crate::util::buf::try_get_string;
use crate::util::safe_converter::SafeCast;

/// Parses a command's payload (the frame without its header)
pub type CommandDecoder = fn(&mut &[u8]) -> Result<Command, SessionError>;

/// Maps wire ids to decoders. A registry is created explicitly and handed to every place that
///  decodes frames, so tests can work with restricted command sets.
#[derive(Clone)]
pub struct CommandRegistry {
    decoders: FxHashMap<u16, CommandDecoder>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl CommandRegistry {
    pub fn empty() -> CommandRegistry {
        CommandRegistry {
            decoders: FxHashMap::default(),
        }
    }

    /// all commands of the protocol
    pub fn standard() -> CommandRegistry {
        let mut result = Self::empty();
        for id in CommandId::ALL {
            result.register(id, standard_decoder(id));
        }
        result
    }

    /// Returns the previously registered decoder for the id, if any
    pub fn register(&mut self, id: CommandId, decoder: CommandDecoder) -> Option<CommandDecoder> {
        self.decoders.insert(id.into(), decoder)
    }

    pub fn is_registered(&self, raw_id: u16) -> bool {
        self.decoders.contains_key(&raw_id)
    }

    /// Decodes a command's payload. The payload must be consumed completely.
    pub fn decode(&self, raw_id: u16, payload: &[u8]) -> Result<Command, SessionError> {
        let decoder = self.decoders.get(&raw_id)
            .ok_or_else(|| SessionError::Framing(format!("unknown command id {}", raw_id)))?;

        let mut parse_buf = payload;
        let command = decoder(&mut parse_buf)?;
        if !parse_buf.is_empty() {
            return Err(SessionError::Framing(format!("{} trailing bytes after {:?}", parse_buf.len(), command.id())));
        }
        trace!("decoded {:?}", command.id());
        Ok(command)
    }

    /// Decodes a complete frame, validating magic number and total length
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Command, SessionError> {
        let (raw_id, total_len) = parse_frame_header(frame)?;
        if total_len != frame.len() {
            return Err(SessionError::Framing(format!("frame length field {} does not match actual length {}", total_len, frame.len())));
        }
        self.decode(raw_id, &frame[FRAME_HEADER_LEN..])
    }
}

/// Validates the magic number and returns command id and total frame length
pub fn parse_frame_header(header: &[u8]) -> Result<(u16, usize), SessionError> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(SessionError::Framing(format!("incomplete frame header of {} bytes", header.len())));
    }
    if header[..4] != FRAME_MAGIC {
        return Err(SessionError::Framing(format!("invalid magic number {:?}", &header[..4])));
    }

    let mut parse_buf = &header[4..FRAME_HEADER_LEN];
    let raw_id = parse_buf.get_u16();
    let total_len: usize = parse_buf.get_u32().safe_cast();
    if total_len < FRAME_HEADER_LEN {
        return Err(SessionError::Framing(format!("frame length {} is shorter than the header", total_len)));
    }
    Ok((raw_id, total_len))
}

fn standard_decoder(id: CommandId) -> CommandDecoder {
    match id {
        CommandId::Data => decode_data,
        CommandId::NewConn => decode_new_conn,
        CommandId::AckNewConn => decode_ack_new_conn,
        CommandId::DataReceived => decode_data_received,
        CommandId::JoinConn => |buf| Ok(Command::JoinConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::CloseConn => |buf| Ok(Command::CloseConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::DataRequest => |buf| Ok(Command::DataRequest { first_packet_to_resend: try_get_packet_id(buf)? }),
        CommandId::AckCloseConn => |buf| Ok(Command::AckCloseConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::JoinCloseConn => |buf| Ok(Command::JoinCloseConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::CloseDataRequestNew => |buf| Ok(Command::CloseDataRequestNew { first_packet_to_resend: try_get_packet_id(buf)? }),
        CommandId::ReadyToCloseConn => |buf| Ok(Command::ReadyToCloseConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::AckJoinConn => |buf| {
            let status = try_get_join_status(buf)?;
            Ok(Command::AckJoinConn { status, identity: ConnectionIdentity::try_deser(buf)? })
        },
        CommandId::AckJoinCloseConn => |buf| {
            let status = try_get_join_status(buf)?;
            Ok(Command::AckJoinCloseConn { status, identity: ConnectionIdentity::try_deser(buf)? })
        },
        CommandId::AckDataRequestOnReconnect => |buf| {
            let first_packet_id_req_to_send = try_get_packet_id(buf)?;
            Ok(Command::AckDataRequestOnReconnect { first_packet_id_req_to_send, identity: ConnectionIdentity::try_deser(buf)? })
        },
        CommandId::AckReadyToCloseConn => |buf| Ok(Command::AckReadyToCloseConn { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::AckCloseDataRequest => |buf| {
            let final_packet_id_sent_by_peer = PacketId::from_wire_opt(buf.try_get_u32()?);
            Ok(Command::AckCloseDataRequest { final_packet_id_sent_by_peer, identity: ConnectionIdentity::try_deser(buf)? })
        },
        CommandId::ReadyToJoin => |buf| Ok(Command::ReadyToJoin { identity: ConnectionIdentity::try_deser(buf)? }),
        CommandId::AckReadyToJoin => |buf| Ok(Command::AckReadyToJoin { identity: ConnectionIdentity::try_deser(buf)? }),
    }
}

fn try_get_packet_id(buf: &mut &[u8]) -> Result<PacketId, SessionError> {
    match PacketId::from_wire_opt(buf.try_get_u32()?) {
        Some(packet_id) => Ok(packet_id),
        None => Err(SessionError::Framing("reserved packet id".to_string())),
    }
}

fn try_get_join_status(buf: &mut &[u8]) -> Result<JoinStatus, SessionError> {
    let raw = buf.try_get_u32()?;
    JoinStatus::try_from(raw)
        .map_err(|_| SessionError::Framing(format!("invalid join status {}", raw)))
}

fn decode_data(buf: &mut &[u8]) -> Result<Command, SessionError> {
    let packet_id = try_get_packet_id(buf)?;
    let data_len: usize = buf.try_get_u32()?.safe_cast();
    if data_len != buf.remaining() {
        return Err(SessionError::Framing(format!("data length {} does not match remaining payload of {} bytes", data_len, buf.remaining())));
    }
    let payload = Bytes::copy_from_slice(&buf[..data_len]);
    buf.advance(data_len);
    Ok(Command::Data { packet_id, payload })
}

fn decode_new_conn(buf: &mut &[u8]) -> Result<Command, SessionError> {
    let identity = ConnectionIdentity::try_deser(buf)?;
    let connector_ip = try_get_string(buf)?;
    let server_port = buf.try_get_u32()?;
    Ok(Command::NewConn { identity, connector_ip, server_port })
}

fn decode_ack_new_conn(buf: &mut &[u8]) -> Result<Command, SessionError> {
    match decode_new_conn(buf)? {
        Command::NewConn { identity, connector_ip, server_port } => Ok(Command::AckNewConn { identity, connector_ip, server_port }),
        _ => unreachable!(),
    }
}

fn decode_data_received(buf: &mut &[u8]) -> Result<Command, SessionError> {
    Ok(Command::DataReceived { last_packet_received: try_get_packet_id(buf)? })
}
