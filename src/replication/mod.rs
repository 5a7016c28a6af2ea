//! Master/replica replication
//!
//! The master side registers a [`ReplicaLink`] per replica that completed a
//! `PSYNC` handshake, propagates every successful write to all links in
//! order, and answers `WAIT` by comparing acknowledged offsets against
//! expected offsets. The replica side dials the master, walks the
//! handshake, and hands the connection back to the server's normal
//! dispatch loop.
//!
//! Offset bookkeeping relies on the codec's canonical encodings: a link's
//! sent offset advances by the exact byte length of each message written.

use crate::common::{Config, Error, Result};
use crate::resp::{Message, RespParser};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Poll interval for WAIT's readiness checks
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Offsets {
    sent: u64,
    acked: u64,
    /// Byte length of a trailing GETACK probe that no ACK has covered yet
    pending_probe: u64,
}

/// Per-replica connection state on the master
#[derive(Clone)]
pub struct ReplicaLink {
    id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    offsets: Arc<StdMutex<Offsets>>,
}

impl ReplicaLink {
    pub fn new(id: u64, writer: Arc<Mutex<OwnedWriteHalf>>, initial_offset: u64) -> Self {
        Self {
            id,
            writer,
            offsets: Arc::new(StdMutex::new(Offsets {
                sent: initial_offset,
                acked: initial_offset,
                pending_probe: 0,
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one message to the replica, advancing the sent offset by its
    /// exact encoded length. The offsets lock is never held across the
    /// socket write.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes();
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        let mut offsets = self.offsets.lock().unwrap();
        offsets.sent += bytes.len() as u64;
        offsets.pending_probe = if msg.is_getack_probe() {
            bytes.len() as u64
        } else {
            0
        };
        Ok(())
    }

    /// Record a `REPLCONF ACK` from this replica. An ACK answering a
    /// GETACK probe reports the offset excluding the probe's own bytes,
    /// so the probe stays excluded until an ACK covers everything sent.
    pub fn record_ack(&self, offset: u64) {
        let mut offsets = self.offsets.lock().unwrap();
        offsets.acked = offset;
        if offset >= offsets.sent {
            offsets.pending_probe = 0;
        }
    }

    pub fn sent_offset(&self) -> u64 {
        self.offsets.lock().unwrap().sent
    }

    pub fn acked_offset(&self) -> u64 {
        self.offsets.lock().unwrap().acked
    }

    /// Offset the replica is expected to acknowledge. A trailing probe is
    /// excluded so the probe itself does not inflate the target.
    pub fn expected_offset(&self) -> u64 {
        let offsets = self.offsets.lock().unwrap();
        offsets.sent - offsets.pending_probe
    }

    pub fn is_caught_up(&self) -> bool {
        let offsets = self.offsets.lock().unwrap();
        offsets.acked >= offsets.sent - offsets.pending_probe
    }
}

/// Process-wide replication state
pub struct ReplicationContext {
    replid: String,
    offset: AtomicU64,
    links: StdMutex<Vec<ReplicaLink>>,
}

impl ReplicationContext {
    pub fn new(replid: String) -> Self {
        Self {
            replid,
            offset: AtomicU64::new(0),
            links: StdMutex::new(Vec::new()),
        }
    }

    /// Master replication id, fixed at process start
    pub fn replid(&self) -> &str {
        &self.replid
    }

    /// Cumulative offset of propagated writes
    pub fn master_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn replica_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn register(&self, link: ReplicaLink) {
        tracing::info!("Registered replica #{}", link.id());
        self.links.lock().unwrap().push(link);
    }

    /// Drop the link for a connection that went away. No effect on other
    /// replicas.
    pub fn unregister(&self, id: u64) {
        let mut links = self.links.lock().unwrap();
        let before = links.len();
        links.retain(|link| link.id() != id);
        if links.len() < before {
            tracing::info!("Removed replica #{}", id);
        }
    }

    pub fn record_ack(&self, id: u64, offset: u64) {
        let links = self.links.lock().unwrap();
        if let Some(link) = links.iter().find(|link| link.id() == id) {
            link.record_ack(offset);
        }
    }

    fn snapshot_links(&self) -> Vec<ReplicaLink> {
        self.links.lock().unwrap().clone()
    }

    /// Send one mutating command to every registered replica, in
    /// registration order. A failing replica is logged and skipped; its
    /// link is removed only once its connection dies.
    pub async fn propagate(&self, msg: &Message) {
        self.offset
            .fetch_add(msg.encoded_len() as u64, Ordering::SeqCst);
        for link in self.snapshot_links() {
            if let Err(e) = link.send(msg).await {
                tracing::warn!("Failed to propagate to replica #{}: {}", link.id(), e);
            }
        }
    }

    fn caught_up_count(&self) -> usize {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter(|link| link.is_caught_up())
            .count()
    }

    /// Block until at least `numreplicas` replicas acknowledged their
    /// expected offset, or the timeout elapses. `timeout_ms` of zero means
    /// no deadline. Never errors; returns the best count observed.
    pub async fn wait(&self, numreplicas: usize, timeout_ms: u64) -> usize {
        let count = self.caught_up_count();
        if count >= numreplicas {
            return count;
        }

        // Nudge lagging replicas into reporting their progress
        let probe = Message::command(&["REPLCONF", "GETACK", "*"]);
        for link in self.snapshot_links() {
            if !link.is_caught_up() {
                if let Err(e) = link.send(&probe).await {
                    tracing::warn!("Failed to probe replica #{}: {}", link.id(), e);
                }
            }
        }

        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            let count = self.caught_up_count();
            if count >= numreplicas {
                return count;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return count;
                }
            }
        }
    }
}

/// The replica's connection to its master after a completed handshake.
/// Any commands the master pipelined behind the snapshot are still
/// buffered in the parser.
pub struct MasterConnection {
    pub parser: RespParser<OwnedReadHalf>,
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl MasterConnection {
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes();
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Dial the master and walk the replica side of the handshake:
/// PING, REPLCONF listening-port, REPLCONF capa, then PSYNC, consuming the
/// FULLRESYNC reply and the inline snapshot payload.
pub async fn connect_to_master(config: &Config) -> Result<MasterConnection> {
    let master = config
        .replicaof
        .as_ref()
        .ok_or_else(|| Error::Replication("no master configured".into()))?;

    tracing::info!("Connecting to master at {}", master);
    let stream = TcpStream::connect((master.host.as_str(), master.port)).await?;
    let (read_half, write_half) = stream.into_split();
    let mut conn = MasterConnection {
        parser: RespParser::new(read_half),
        writer: Arc::new(Mutex::new(write_half)),
    };

    conn.send(&Message::command(&["PING"])).await?;
    expect_handshake_reply(&mut conn).await?;

    let port = config.port.to_string();
    conn.send(&Message::command(&["REPLCONF", "listening-port", &port]))
        .await?;
    expect_handshake_reply(&mut conn).await?;

    conn.send(&Message::command(&["REPLCONF", "capa", "psync2"]))
        .await?;
    expect_handshake_reply(&mut conn).await?;

    conn.send(&Message::command(&["PSYNC", "?", "-1"])).await?;
    let resync = expect_handshake_reply(&mut conn).await?;
    tracing::info!("Master replied: {:?}", resync);
    let snapshot = expect_handshake_reply(&mut conn).await?;
    match snapshot {
        Message::RawPayload(bytes) => {
            tracing::info!("Received full resync snapshot ({} bytes)", bytes.len());
        }
        other => {
            return Err(Error::Replication(format!(
                "expected snapshot payload, got {:?}",
                other
            )))
        }
    }

    Ok(conn)
}

async fn expect_handshake_reply(conn: &mut MasterConnection) -> Result<Message> {
    conn.parser
        .read_message()
        .await?
        .ok_or_else(|| Error::Replication("master closed connection during handshake".into()))
}
