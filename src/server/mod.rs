//! TCP server: accept loop, per-connection tasks, and the replica-side
//! link to the master.

pub mod dispatcher;

pub use dispatcher::CommandDispatcher;

use crate::common::{generate_replication_id, Config, Error, Result};
use crate::rdb;
use crate::replication::{self, ReplicationContext};
use crate::resp::RespParser;
use crate::store::KeySpace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Per-connection state shared with the dispatcher
pub struct ClientHandle {
    /// Connection id, unique for the lifetime of the process
    pub id: u64,
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
    /// True when the peer is the master this node replicates from
    pub is_master_link: bool,
    /// Bytes of master traffic processed so far, reported via
    /// `REPLCONF GETACK`. Only meaningful on a master link.
    pub repl_offset: Arc<AtomicU64>,
}

impl ClientHandle {
    pub fn new(id: u64, writer: Arc<Mutex<OwnedWriteHalf>>) -> Self {
        Self {
            id,
            writer,
            is_master_link: false,
            repl_offset: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle for the connection to this node's master
    pub fn master_link(writer: Arc<Mutex<OwnedWriteHalf>>) -> Self {
        Self {
            id: 0,
            writer,
            is_master_link: true,
            repl_offset: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct Server {
    config: Config,
    dispatcher: Arc<CommandDispatcher>,
    replication: Arc<ReplicationContext>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let replication = Arc::new(ReplicationContext::new(generate_replication_id()));
        let keyspace = Arc::new(StdMutex::new(load_keyspace(&config)));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.clone(),
            keyspace,
            replication.clone(),
        ));
        Self {
            config,
            dispatcher,
            replication,
        }
    }

    /// Bind the listening socket and serve connections until the process
    /// shuts down.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!(
            "Listening on {} as {}",
            listener.local_addr()?,
            self.config.role()
        );

        if self.config.replicaof.is_some() {
            let config = self.config.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                replicate_from_master(config, dispatcher).await;
            });
        }

        let mut next_id: u64 = 0;
        loop {
            let (stream, addr) = listener.accept().await?;
            next_id += 1;
            let id = next_id;
            tracing::debug!("Accepted connection #{} from {}", id, addr);

            let dispatcher = self.dispatcher.clone();
            let replication = self.replication.clone();
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                let parser = RespParser::new(read_half);
                let client = ClientHandle::new(id, Arc::new(Mutex::new(write_half)));
                if let Err(e) = connection_loop(&dispatcher, parser, &client).await {
                    tracing::warn!("Connection #{} failed: {}", id, e);
                }
                // Harmless for ordinary clients, required for replicas
                replication.unregister(id);
                tracing::debug!("Connection #{} closed", id);
            });
        }
    }
}

/// Read messages off one connection and dispatch them until the peer
/// disconnects. Protocol errors are fatal for this connection only.
pub async fn connection_loop<R: AsyncRead + Unpin>(
    dispatcher: &CommandDispatcher,
    mut parser: RespParser<R>,
    client: &ClientHandle,
) -> Result<()> {
    while let Some((message, consumed)) = parser.read_frame().await? {
        let responses = dispatcher.handle(message, client).await;
        for response in &responses {
            let mut writer = client.writer.lock().await;
            writer.write_all(&response.to_bytes()).await?;
            writer.flush().await?;
        }
        // The acknowledged offset covers everything before this command,
        // so a GETACK answers with the offset excluding its own bytes
        if client.is_master_link {
            client.repl_offset.fetch_add(consumed as u64, Ordering::SeqCst);
        }
    }
    Ok(())
}

/// Replica side: handshake with the master, then treat the connection as
/// one more command source feeding the shared dispatcher.
async fn replicate_from_master(config: Config, dispatcher: Arc<CommandDispatcher>) {
    match replication::connect_to_master(&config).await {
        Ok(conn) => {
            let client = ClientHandle::master_link(conn.writer.clone());
            if let Err(e) = connection_loop(&dispatcher, conn.parser, &client).await {
                tracing::error!("Master link failed: {}", e);
            } else {
                tracing::info!("Master closed the replication link");
            }
        }
        Err(e) => {
            tracing::error!("Replication handshake failed: {}", e);
        }
    }
}

/// Load the configured snapshot. A missing or undecodable file logs a
/// warning and yields an empty keyspace rather than refusing to start.
fn load_keyspace(config: &Config) -> KeySpace {
    let Some(path) = config.snapshot_path() else {
        return KeySpace::new();
    };
    let loaded = std::fs::read(&path)
        .map_err(Error::from)
        .and_then(|bytes| rdb::decode(&bytes));
    match loaded {
        Ok(snapshot) => {
            let keyspace = KeySpace::from_snapshot(&snapshot);
            tracing::info!(
                "Loaded {} keys from snapshot {}",
                keyspace.len(),
                path.display()
            );
            keyspace
        }
        Err(e) => {
            tracing::warn!(
                "Could not load snapshot {}: {}; starting empty",
                path.display(),
                e
            );
            KeySpace::new()
        }
    }
}
