//! Two-phase, rejoin-safe close.
//!
//! Phase 1: the initiator sends `ReadyToCloseConn`, the peer enters CLOSING and answers
//!  `AckReadyToCloseConn` once everything it sent was acked.
//!
//! Phase 2: the initiator sends `CloseDataRequestNew` with its receive cursor, the peer resends
//!  anything from there and answers `AckCloseDataRequest` with the last packet id it ever sent. Once
//!  the initiator received everything up to that id and its own pending-send buffer is empty, it
//!  sends `CloseConn`. The peer answers `AckCloseConn` (again only with an empty pending-send
//!  buffer) and is done, and the initiator is done when the `AckCloseConn` arrives.
//!
//! When both sides close at the same time, both sequences run, and each side finishes by answering
//!  the other side's `CloseConn`.
//!
//! The coordinator itself does no I/O. It is polled with a snapshot of the connection and returns
//!  the frames that are due, so that it can be driven again after a physical socket was replaced.

use crate::packet_id::PacketId;

/// A close-phase frame that is due for sending
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseAction {
    SendReadyToClose,
    SendAckReadyToClose,
    /// carries the sender's receive cursor, which the coordinator does not know
    SendCloseDataRequest,
    SendCloseConn,
    SendAckCloseConn,
}

/// The parts of the connection's state that the close protocol depends on
#[derive(Debug, Clone, Copy)]
pub struct CloseView {
    pub send_buffer_empty: bool,
    pub last_received: Option<PacketId>,
}

#[derive(Debug, Default)]
pub struct CloseCoordinator {
    local_requested: bool,
    ready_request_sent: bool,
    peer_ready_acked: bool,
    final_request_sent: bool,
    /// the peer's answer to our `CloseDataRequestNew`, i.e. the last packet id the peer ever sent
    peer_final: Option<Option<PacketId>>,
    close_conn_sent: bool,

    peer_requested: bool,
    ready_ack_sent: bool,
    peer_close_received: bool,

    finished: bool,
}

impl CloseCoordinator {
    pub fn new() -> CloseCoordinator {
        Default::default()
    }

    /// Once a close was requested by either side, no application data can be sent any more
    pub fn is_closing(&self) -> bool {
        self.local_requested || self.peer_requested
    }

    #[cfg(test)]
    pub fn is_local_requested(&self) -> bool {
        self.local_requested
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `CloseConn` was sent. Nothing can be outstanding at that point, so a connection that is
    ///  lost afterwards still counts as closed gracefully.
    pub fn is_local_part_complete(&self) -> bool {
        self.close_conn_sent || self.finished
    }

    /// returns `true` if this is the first request
    pub fn request_local(&mut self) -> bool {
        !std::mem::replace(&mut self.local_requested, true)
    }

    pub fn on_peer_requested(&mut self) {
        self.peer_requested = true;
        // the peer asks again after a rejoin if our ack was lost
        self.ready_ack_sent = false;
    }

    pub fn on_peer_ready_acked(&mut self) {
        self.peer_ready_acked = true;
    }

    pub fn on_peer_final(&mut self, final_packet_id: Option<PacketId>) {
        self.peer_final = Some(final_packet_id);
    }

    pub fn on_peer_close(&mut self) {
        self.peer_close_received = true;
    }

    pub fn on_close_acked(&mut self) {
        self.finished = true;
    }

    /// Returns the frames that became due, in the order they must be sent. An `AckCloseConn`
    ///  finishes the close.
    pub fn poll(&mut self, view: &CloseView) -> Vec<CloseAction> {
        let mut result = Vec::new();
        if self.finished {
            return result;
        }

        if self.local_requested && !self.ready_request_sent {
            self.ready_request_sent = true;
            result.push(CloseAction::SendReadyToClose);
        }

        if self.peer_requested && !self.ready_ack_sent && view.send_buffer_empty {
            self.ready_ack_sent = true;
            result.push(CloseAction::SendAckReadyToClose);
        }

        if self.local_requested && self.peer_ready_acked && !self.final_request_sent {
            self.final_request_sent = true;
            result.push(CloseAction::SendCloseDataRequest);
        }

        if let Some(peer_final) = self.peer_final {
            let received_all = match peer_final {
                None => true,
                Some(final_packet_id) => view.last_received.map_or(false, |last| last >= final_packet_id),
            };
            if received_all && view.send_buffer_empty && !self.close_conn_sent {
                self.close_conn_sent = true;
                result.push(CloseAction::SendCloseConn);
            }
        }

        if self.peer_close_received && view.send_buffer_empty {
            self.finished = true;
            result.push(CloseAction::SendAckCloseConn);
        }

        result
    }

    /// The frames that were sent but not answered yet. After a physical socket is replaced, they
    ///  are sent again: the answer may have been lost with the old socket.
    pub fn redrive(&self) -> Vec<CloseAction> {
        let mut result = Vec::new();
        if self.finished {
            return result;
        }

        if self.ready_request_sent && !self.peer_ready_acked {
            result.push(CloseAction::SendReadyToClose);
        }
        if self.final_request_sent && self.peer_final.is_none() {
            result.push(CloseAction::SendCloseDataRequest);
        }
        if self.close_conn_sent {
            result.push(CloseAction::SendCloseConn);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use CloseAction::*;

    fn view(send_buffer_empty: bool, last_received: Option<u32>) -> CloseView {
        CloseView {
            send_buffer_empty,
            last_received: last_received.map(PacketId::from_raw),
        }
    }

    #[test]
    fn test_initiator_sequence() {
        let mut close = CloseCoordinator::new();
        assert!(!close.is_closing());

        assert!(close.request_local());
        assert!(!close.request_local());
        assert!(close.is_closing());

        assert_eq!(close.poll(&view(false, None)), vec![SendReadyToClose]);
        assert_eq!(close.poll(&view(false, None)), vec![]);

        close.on_peer_ready_acked();
        assert_eq!(close.poll(&view(false, None)), vec![SendCloseDataRequest]);

        close.on_peer_final(Some(PacketId::from_raw(7)));
        assert_eq!(close.poll(&view(false, Some(7))), vec![]);
        assert_eq!(close.poll(&view(true, Some(6))), vec![]);
        assert!(!close.is_local_part_complete());
        assert_eq!(close.poll(&view(true, Some(7))), vec![SendCloseConn]);
        assert!(close.is_local_part_complete());
        assert!(!close.is_finished());

        close.on_close_acked();
        assert!(close.is_finished());
        assert_eq!(close.poll(&view(true, Some(7))), vec![]);
    }

    #[test]
    fn test_peer_never_sent_anything() {
        let mut close = CloseCoordinator::new();
        close.request_local();
        close.poll(&view(true, None));
        close.on_peer_ready_acked();
        close.poll(&view(true, None));
        close.on_peer_final(None);
        assert_eq!(close.poll(&view(true, None)), vec![SendCloseConn]);
    }

    #[test]
    fn test_responder_sequence() {
        let mut close = CloseCoordinator::new();
        close.on_peer_requested();
        assert!(close.is_closing());
        assert!(!close.is_local_requested());

        // everything sent must be acked before the peer is told we are ready
        assert_eq!(close.poll(&view(false, Some(3))), vec![]);
        assert_eq!(close.poll(&view(true, Some(3))), vec![SendAckReadyToClose]);
        assert_eq!(close.poll(&view(true, Some(3))), vec![]);

        close.on_peer_close();
        assert_eq!(close.poll(&view(true, Some(3))), vec![SendAckCloseConn]);
        assert!(close.is_finished());
    }

    #[test]
    fn test_repeated_ready_request_is_answered_again() {
        let mut close = CloseCoordinator::new();
        close.on_peer_requested();
        assert_eq!(close.poll(&view(true, None)), vec![SendAckReadyToClose]);

        close.on_peer_requested();
        assert_eq!(close.poll(&view(true, None)), vec![SendAckReadyToClose]);
    }

    #[test]
    fn test_simultaneous_close() {
        let mut close = CloseCoordinator::new();
        close.request_local();
        close.on_peer_requested();
        assert_eq!(close.poll(&view(true, None)), vec![SendReadyToClose, SendAckReadyToClose]);

        close.on_peer_ready_acked();
        assert_eq!(close.poll(&view(true, None)), vec![SendCloseDataRequest]);
        close.on_peer_final(None);
        assert_eq!(close.poll(&view(true, None)), vec![SendCloseConn]);

        // the peer's CloseConn crosses our own
        close.on_peer_close();
        assert_eq!(close.poll(&view(true, None)), vec![SendAckCloseConn]);
        assert!(close.is_finished());
    }

    #[test]
    fn test_peer_close_waits_for_empty_buffer() {
        let mut close = CloseCoordinator::new();
        close.on_peer_requested();
        close.on_peer_close();
        assert_eq!(close.poll(&view(false, None)), vec![]);
        assert!(!close.is_finished());
        assert_eq!(close.poll(&view(true, None)), vec![SendAckReadyToClose, SendAckCloseConn]);
    }

    #[rstest]
    #[case::nothing_requested(0, vec![])]
    #[case::ready_sent(1, vec![SendReadyToClose])]
    #[case::ready_acked(2, vec![SendCloseDataRequest])]
    #[case::final_received(3, vec![SendCloseConn])]
    #[case::finished(4, vec![])]
    fn test_redrive(#[case] progress: u32, #[case] expected: Vec<CloseAction>) {
        let mut close = CloseCoordinator::new();
        let v = view(true, Some(10));
        if progress >= 1 {
            close.request_local();
            close.poll(&v);
        }
        if progress >= 2 {
            close.on_peer_ready_acked();
            close.poll(&v);
        }
        if progress >= 3 {
            close.on_peer_final(Some(PacketId::from_raw(10)));
            close.poll(&v);
        }
        if progress >= 4 {
            close.on_close_acked();
        }

        assert_eq!(close.redrive(), expected);
    }

    #[test]
    fn test_redrive_does_not_affect_poll() {
        let mut close = CloseCoordinator::new();
        close.request_local();
        assert_eq!(close.poll(&view(true, None)), vec![SendReadyToClose]);
        assert_eq!(close.redrive(), vec![SendReadyToClose]);
        assert_eq!(close.poll(&view(true, None)), vec![]);
    }
}
