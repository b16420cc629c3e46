use std::collections::BTreeMap;
use bytes::Bytes;
use tracing::{trace, warn};
use crate::packet_id::PacketId;

/// Sender side store of every data packet that was transmitted (or at least registered for
///  transmission) but is not yet covered by the peer's cumulative ack.
///
/// Packets are registered *before* they are written to a physical socket, so a packet that never
///  made it to the peer because the socket broke is still available for resending.
pub struct PendingSendBuffer {
    entries: BTreeMap<PacketId, Bytes>,
    /// id of the next packet to be registered
    next_packet_id: PacketId,
}

impl Default for PendingSendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSendBuffer {
    pub fn new() -> PendingSendBuffer {
        PendingSendBuffer {
            entries: BTreeMap::default(),
            next_packet_id: PacketId::ZERO,
        }
    }

    /// Assigns the next packet id and stores the payload under it. Returns `None` if the packet id
    ///  space is exhausted.
    pub fn register(&mut self, payload: Bytes) -> Option<PacketId> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = packet_id.next()?;
        self.entries.insert(packet_id, payload);
        Some(packet_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The id the next registered packet will get
    pub fn next_packet_id(&self) -> PacketId {
        self.next_packet_id
    }

    /// The highest id ever registered, i.e. the final packet id if nothing more is sent
    pub fn last_registered(&self) -> Option<PacketId> {
        self.next_packet_id.prev()
    }

    #[cfg(test)]
    pub fn first_pending(&self) -> Option<PacketId> {
        self.entries.keys().next().cloned()
    }

    /// Removes all entries up to and including `last_received`, returning the number of removed
    ///  entries. An ack for packets that were never sent is clamped to the last registered packet.
    pub fn on_cumulative_ack(&mut self, last_received: PacketId) -> usize {
        let last_received = match self.last_registered() {
            None => {
                warn!("ack for packet {} although no packet was sent - ignoring", last_received);
                return 0;
            }
            Some(last_registered) if last_received > last_registered => {
                warn!("ack for packet {} beyond the last sent packet {} - clamping", last_received, last_registered);
                last_registered
            }
            Some(_) => last_received,
        };

        match last_received.next() {
            Some(first_needed) => self.purge_below(first_needed),
            None => {
                let num_removed = self.entries.len();
                self.entries.clear();
                num_removed
            }
        }
    }

    /// Removes all entries below `first_needed`, which the peer reported as its receive cursor
    pub fn purge_below(&mut self, first_needed: PacketId) -> usize {
        let retained = self.entries.split_off(&first_needed);
        let num_removed = self.entries.len();
        self.entries = retained;

        if num_removed > 0 {
            trace!("purged {} acknowledged packets below {}", num_removed, first_needed);
        }
        num_removed
    }

    /// All retained packets from `first` on, in packet id order
    pub fn resend_from(&self, first: PacketId) -> impl Iterator<Item = (PacketId, &Bytes)> {
        self.entries.range(first..)
            .map(|(&packet_id, payload)| (packet_id, payload))
    }

    pub fn clear(&mut self) -> usize {
        let num_removed = self.entries.len();
        self.entries.clear();
        num_removed
    }
}
