use std::fmt::{Display, Formatter};
use std::ops::Add;

/// Sequence number of a `Data` frame within one direction of a logical connection.
///
/// Packet ids are u32 on the wire. The all-ones bit pattern is reserved for 'no packet', see
///  [PacketId::to_wire_opt], so the highest usable id is `u32::MAX - 1`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u32> for PacketId {
    type Output = PacketId;

    fn add(self, rhs: u32) -> Self::Output {
        PacketId::from_raw(self.0 + rhs)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);
    pub const MAX: PacketId = PacketId(u32::MAX - 1);

    const WIRE_NONE: u32 = u32::MAX;

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// Returns `None` at the end of the id space - a connection that transferred four billion
    ///  packets has to be re-opened
    pub fn next(&self) -> Option<PacketId> {
        if *self >= Self::MAX {
            return None;
        }
        Some(PacketId(self.0 + 1))
    }

    pub fn prev(&self) -> Option<PacketId> {
        self.0.checked_sub(1).map(PacketId)
    }

    pub fn to_wire_opt(id: Option<PacketId>) -> u32 {
        match id {
            Some(id) => id.0,
            None => Self::WIRE_NONE,
        }
    }

    pub fn from_wire_opt(raw: u32) -> Option<PacketId> {
        if raw == Self::WIRE_NONE {
            None
        }
        else {
            Some(PacketId(raw))
        }
    }
}
