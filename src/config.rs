use std::time::Duration;
use anyhow::bail;
use crate::command::FRAME_HEADER_LEN;

#[derive(Debug, Clone)]
pub struct NonBreakingConfig {
    /// Application bytes are split into `Data` frames carrying at most this many bytes.
    pub max_data_chunk_len: usize,

    /// Upper bound for the total length of any frame a reader accepts. A frame announcing a bigger
    ///  length poisons the physical socket.
    pub max_frame_len: usize,

    /// This is the maximum number of *packets* (not bytes) stored on the sender side pending an
    ///  ack. Writers block when the window is full, which is how backpressure reaches the
    ///  application.
    pub send_window_packets: usize,

    /// Packets arriving ahead of a gap are buffered up to this number; beyond that they are dropped
    ///  and the receiver relies on the resend.
    pub max_out_of_order_packets: usize,

    /// A cumulative ack is sent after the application read this many packets (or half the send
    ///  window if that is less) ...
    pub ack_every_n_packets: u32,
    /// ... and periodically if the application read anything since the last ack
    pub ack_interval: Duration,

    /// An otherwise idle physical socket carries a small control frame this often ...
    pub keepalive_interval: Duration,
    /// ... and a physical socket on which nothing arrives for this long is considered dead
    pub link_idle_timeout: Duration,

    pub connect_timeout: Duration,
    /// bound for waiting on each handshake frame, both for opening and for rejoining
    pub handshake_timeout: Duration,

    /// The active side gives up after this many failed rejoin attempts
    pub max_rejoin_attempts: u32,
    pub rejoin_initial_backoff: Duration,
    pub rejoin_max_backoff: Duration,
    /// growth of the backoff per failed attempt, in eighths (16 doubles the delay)
    pub rejoin_backoff_factor_eighths: u32,

    /// The passive side gives up if nobody rejoins for this long
    pub passive_rejoin_timeout: Duration,

    /// number of passively opened connections waiting to be picked up by `accept()`
    pub accept_queue_len: usize,
}

impl Default for NonBreakingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NonBreakingConfig {
    pub fn new() -> NonBreakingConfig {
        NonBreakingConfig {
            max_data_chunk_len: 16*1024,
            max_frame_len: 1024*1024,
            send_window_packets: 1024,
            max_out_of_order_packets: 4096,
            ack_every_n_packets: 16,
            ack_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(5),
            link_idle_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_rejoin_attempts: 20,
            rejoin_initial_backoff: Duration::from_millis(50),
            rejoin_max_backoff: Duration::from_secs(5),
            rejoin_backoff_factor_eighths: 16,
            passive_rejoin_timeout: Duration::from_secs(120),
            accept_queue_len: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_data_chunk_len == 0 {
            bail!("max data chunk length must be positive");
        }
        if self.max_frame_len < FRAME_HEADER_LEN + 8 + self.max_data_chunk_len {
            bail!("max frame length {} can not hold a data chunk of {} bytes", self.max_frame_len, self.max_data_chunk_len);
        }
        if self.max_frame_len > u32::MAX as usize {
            bail!("max frame length must fit into the u32 length field");
        }
        if self.send_window_packets == 0 {
            bail!("send window must hold at least one packet");
        }
        if self.ack_every_n_packets == 0 {
            bail!("ack_every_n_packets must be positive");
        }
        if self.keepalive_interval.is_zero() {
            bail!("keepalive interval must be positive");
        }
        if self.keepalive_interval >= self.link_idle_timeout {
            bail!("keepalive interval {:?} must be shorter than the link idle timeout {:?}", self.keepalive_interval, self.link_idle_timeout);
        }
        if self.rejoin_backoff_factor_eighths < 8 {
            bail!("rejoin backoff factor must be at least 8/8");
        }
        if self.rejoin_initial_backoff > self.rejoin_max_backoff {
            bail!("initial rejoin backoff exceeds the maximum");
        }
        if self.max_rejoin_attempts == 0 {
            bail!("at least one rejoin attempt is required");
        }
        Ok(())
    }

    /// Number of packets the application reads between two acks. Capped at half the send window
    ///  so that a writer waiting for room does not depend on the periodic ack.
    pub fn ack_threshold(&self) -> u64 {
        let half_window = (self.send_window_packets / 2).max(1) as u64;
        half_window.min(self.ack_every_n_packets as u64)
    }
}
