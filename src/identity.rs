use std::fmt::{Debug, Display, Formatter};
use bytes::{Buf, BufMut};
use crate::error::SessionError;
use crate::util::buf::{put_string, try_get_string};

/// Identifies a logical connection across any number of physical sockets.
///
/// `node_uuid` is the UUID of the node that actively opened the connection, `connection_id` is
///  unique within that node. Both sides of a connection use the same identity, and it never changes
///  for the connection's lifetime.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionIdentity {
    pub node_uuid: String,
    pub connection_id: u32,
}

impl Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}#{}]", self.node_uuid, self.connection_id)
    }
}

impl Display for ConnectionIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl ConnectionIdentity {
    pub fn new(node_uuid: impl Into<String>, connection_id: u32) -> ConnectionIdentity {
        ConnectionIdentity {
            node_uuid: node_uuid.into(),
            connection_id,
        }
    }

    #[cfg(test)]
    pub fn serialized_len(&self) -> usize {
        4 + self.node_uuid.len() + 4
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.node_uuid);
        buf.put_u32(self.connection_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ConnectionIdentity, SessionError> {
        let node_uuid = try_get_string(buf)?;
        let connection_id = buf.try_get_u32()?;
        Ok(ConnectionIdentity {
            node_uuid,
            connection_id,
        })
    }
}
