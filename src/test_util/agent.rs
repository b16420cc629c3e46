//! Agents that push random data through a [NonBreakingStream] in both directions and report what
//!  they sent and received, so that tests can check nothing was lost, duplicated or reordered.
//!
//! Each agent first announces the total number of bytes it is going to send (as a big-endian u64),
//!  which lets the receiving agent know when it has seen everything without relying on the end of
//!  the stream.

use crc::{Crc, CRC_32_ISO_HDLC};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use crate::connection::stream::{NonBreakingReadHalf, NonBreakingStream, NonBreakingWriteHalf};
use crate::error::SessionError;
use crate::identity::ConnectionIdentity;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// What went through one direction of a connection. Data packets carry consecutive ids starting at
///  zero, so the number of packets together with the checksum over their content pins down the
///  packet sequence as well as the bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransferDigest {
    pub num_bytes: u64,
    pub num_packets: u32,
    pub crc: u32,
}

#[derive(Debug, Clone)]
pub struct AgentParams {
    pub seed: u64,
    pub num_writes: usize,
    pub max_write_len: usize,
    /// If set, the agent closes the connection once everything was exchanged. Otherwise it waits
    ///  for the peer to close it.
    pub closes: bool,
}

#[derive(Debug, Clone)]
pub struct AgentReport {
    pub identity: ConnectionIdentity,
    pub sent: TransferDigest,
    pub received: TransferDigest,
}

pub async fn run_random_agent(stream: NonBreakingStream, params: AgentParams) -> anyhow::Result<AgentReport> {
    let identity = stream.identity().clone();
    let (mut reader, writer) = stream.into_split();

    let sender = tokio::spawn(send_random(writer.clone(), params.clone()));
    let received = receive_announced(&mut reader).await?;
    let sent = sender.await??;

    if params.closes {
        writer.close().await?;
    }
    else {
        if let Some(unexpected) = reader.read_chunk().await? {
            anyhow::bail!("{} received {} bytes beyond the announced end", identity, unexpected.len());
        }
        writer.close().await?;
    }

    debug!("agent for {} is done: sent {:?}, received {:?}", identity, sent, received);
    Ok(AgentReport {
        identity,
        sent,
        received,
    })
}

/// Sends an announced amount of random data, in writes of random length
pub async fn send_random(writer: NonBreakingWriteHalf, params: AgentParams) -> Result<TransferDigest, SessionError> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let writes: Vec<Vec<u8>> = (0..params.num_writes)
        .map(|_| {
            let len = rng.gen_range(1..=params.max_write_len);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect();

    let num_bytes = writes.iter()
        .map(|w| w.len() as u64)
        .sum::<u64>();
    writer.write_all(&num_bytes.to_be_bytes()).await?;

    let mut digest = CRC32.digest();
    for w in &writes {
        writer.write_all(w).await?;
        digest.update(w);
    }

    Ok(TransferDigest {
        num_bytes,
        num_packets: writer.connection().num_packets_sent().await,
        crc: digest.finalize(),
    })
}

/// Reads the length announcement and then exactly the announced number of bytes
pub async fn receive_announced(reader: &mut NonBreakingReadHalf) -> Result<TransferDigest, SessionError> {
    let mut announcement = [0u8; 8];
    reader.read_exact(&mut announcement).await?;
    let num_bytes = u64::from_be_bytes(announcement);

    let mut digest = CRC32.digest();
    let mut buf = vec![0u8; 8192];
    let mut remaining = num_bytes;
    while remaining > 0 {
        let max_len = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..max_len]).await?;
        if n == 0 {
            return Err(SessionError::ProtocolViolation(format!("stream ended {} bytes before the announced end", remaining)));
        }
        digest.update(&buf[..n]);
        remaining -= n as u64;
    }

    // the peer sends nothing beyond the announced data, so everything received was read
    Ok(TransferDigest {
        num_bytes,
        num_packets: reader.connection().receive_cursor().await.to_raw(),
        crc: digest.finalize(),
    })
}
