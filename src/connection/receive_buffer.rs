use std::collections::BTreeMap;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::packet_id::PacketId;

#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The packet was the expected one. Contains its payload followed by the payloads of all
    ///  buffered packets that directly follow it, in order.
    Delivered(Vec<Bytes>),
    /// The packet is ahead of the cursor. `request_resend_from` is `Some(cursor)` if a resend should
    ///  be requested, and `None` if an earlier request still covers the gap.
    Gap {
        request_resend_from: Option<PacketId>,
    },
    /// The packet is below the cursor or already buffered - nothing to do
    Duplicate,
}

/// Receiver side sequencing: the cursor (next expected packet id) and the packets that arrived
///  ahead of a gap.
pub struct ReceiveSequencer {
    /// the next packet id to be delivered to the application
    cursor: PacketId,
    out_of_order: BTreeMap<PacketId, Bytes>,
    max_out_of_order: usize,

    /// If a resend was requested, this is the cursor at the time of the request. The peer resends
    ///  everything it has from there, so there is no point in requesting again for a cursor at or
    ///  beyond this.
    outstanding_request: Option<PacketId>,
}

impl ReceiveSequencer {
    pub fn new(max_out_of_order: usize) -> ReceiveSequencer {
        ReceiveSequencer {
            cursor: PacketId::ZERO,
            out_of_order: BTreeMap::default(),
            max_out_of_order,
            outstanding_request: None,
        }
    }

    pub fn cursor(&self) -> PacketId {
        self.cursor
    }

    /// cumulative ack: the highest packet id up to which everything was received
    pub fn last_received(&self) -> Option<PacketId> {
        self.cursor.prev()
    }

    #[cfg(test)]
    pub fn num_out_of_order(&self) -> usize {
        self.out_of_order.len()
    }

    /// A new physical socket does not carry any resend requested on an old one
    pub fn forget_outstanding_request(&mut self) {
        self.outstanding_request = None;
    }

    /// The peer was asked to resend from `first`, e.g. as part of a rejoin
    pub fn on_resend_requested(&mut self, first: PacketId) {
        self.outstanding_request = Some(first);
    }

    pub fn on_data(&mut self, packet_id: PacketId, payload: Bytes) -> ReceiveOutcome {
        if packet_id < self.cursor {
            trace!("packet {} is below cursor {} - discarding duplicate", packet_id, self.cursor);
            return ReceiveOutcome::Duplicate;
        }

        if packet_id > self.cursor {
            if self.out_of_order.contains_key(&packet_id) {
                trace!("packet {} is already buffered - discarding duplicate", packet_id);
                return ReceiveOutcome::Duplicate;
            }

            if self.out_of_order.len() < self.max_out_of_order {
                self.out_of_order.insert(packet_id, payload);
            }
            else {
                debug!("out-of-order buffer is full - dropping packet {} and relying on resend", packet_id);
            }

            let request_resend_from = match self.outstanding_request {
                Some(requested) if self.cursor >= requested => None,
                _ => {
                    self.outstanding_request = Some(self.cursor);
                    Some(self.cursor)
                }
            };
            trace!("gap: expected packet {}, received {}", self.cursor, packet_id);
            return ReceiveOutcome::Gap { request_resend_from };
        }

        let mut delivered = vec![payload];
        self.advance_cursor();

        while let Some(payload) = self.out_of_order.remove(&self.cursor) {
            delivered.push(payload);
            self.advance_cursor();
        }

        if self.out_of_order.is_empty() {
            self.outstanding_request = None;
        }
        ReceiveOutcome::Delivered(delivered)
    }

    fn advance_cursor(&mut self) {
        // the sender can not send beyond PacketId::MAX, so there is nothing to receive after it
        self.cursor = self.cursor.next().unwrap_or(self.cursor);
    }
}
