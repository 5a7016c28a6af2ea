//! Command dispatch
//!
//! Translates one decoded array-of-bulk-strings message into a command and
//! executes it against the keyspace and the replication context. Every
//! failure path comes back as a RESP error message; the dispatcher itself
//! never panics and never closes the connection.

use crate::common::{Config, Error, Result, ServerRole};
use crate::replication::{ReplicaLink, ReplicationContext};
use crate::resp::Message;
use crate::server::ClientHandle;
use crate::store::{KeySpace, StreamId, StreamItem};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Poll interval for blocking XREAD
const XREAD_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct CommandDispatcher {
    config: Config,
    role: ServerRole,
    keyspace: Arc<StdMutex<KeySpace>>,
    replication: Arc<ReplicationContext>,
    /// Serializes mutation + propagation so propagated commands reach every
    /// replica in keyspace order. Held across the propagation await; the
    /// keyspace mutex itself never is.
    write_lock: Mutex<()>,
}

impl CommandDispatcher {
    pub fn new(
        config: Config,
        keyspace: Arc<StdMutex<KeySpace>>,
        replication: Arc<ReplicationContext>,
    ) -> Self {
        let role = config.role();
        Self {
            config,
            role,
            keyspace,
            replication,
            write_lock: Mutex::new(()),
        }
    }

    /// Execute one decoded message, returning zero or more replies.
    pub async fn handle(&self, message: Message, client: &ClientHandle) -> Vec<Message> {
        let Message::Array(values) = &message else {
            // Replies and stray non-command traffic produce no response
            return Vec::new();
        };
        let (verb, args) = match parse_command(values) {
            Ok(parsed) => parsed,
            Err(e) => return vec![e.to_message()],
        };

        let responses = match verb.as_str() {
            "PING" => Ok(vec![Message::SimpleString("PONG".into())]),
            "ECHO" => echo(&args),
            "GET" => self.get(&args),
            "SET" => self.set(&args, &message).await,
            "KEYS" => Ok(self.keys()),
            "TYPE" => self.type_of(&args),
            "CONFIG" => self.config_get(&args),
            "INFO" => Ok(self.info(&args)),
            "XADD" => self.xadd(&args),
            "XRANGE" => self.xrange(&args),
            "XREAD" => self.xread(&args).await,
            "WAIT" => self.wait(&args).await,
            "REPLCONF" => self.replconf(&args, client),
            "PSYNC" => self.psync(&args, client).await,
            // Unrecognized verbs get no reply rather than a closed connection
            _ => Ok(Vec::new()),
        };
        let responses = responses.unwrap_or_else(|e| vec![e.to_message()]);

        // A replica answers its master only for replication control traffic
        if client.is_master_link && verb != "REPLCONF" {
            return Vec::new();
        }
        responses
    }

    fn get(&self, args: &[String]) -> Result<Vec<Message>> {
        let key = args.first().ok_or_else(|| Error::WrongArity("get".into()))?;
        let value = self.keyspace.lock().unwrap().get(key);
        Ok(vec![match value {
            Some(value) => Message::BulkString(value),
            None => Message::NullBulkString,
        }])
    }

    async fn set(&self, args: &[String], message: &Message) -> Result<Vec<Message>> {
        if args.len() < 2 {
            return Err(Error::WrongArity("set".into()));
        }
        let ttl_ms = if args.len() >= 4 && args[2].eq_ignore_ascii_case("px") {
            Some(
                args[3]
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidCommand("value is not an integer".into()))?,
            )
        } else {
            None
        };

        // Mutation and propagation happen as one ordered unit
        let _guard = self.write_lock.lock().await;
        self.keyspace.lock().unwrap().set(&args[0], &args[1], ttl_ms);
        self.replication.propagate(message).await;
        Ok(vec![Message::SimpleString("OK".into())])
    }

    fn keys(&self) -> Vec<Message> {
        let keys = self.keyspace.lock().unwrap().keys();
        vec![Message::Array(
            keys.into_iter().map(Message::BulkString).collect(),
        )]
    }

    fn type_of(&self, args: &[String]) -> Result<Vec<Message>> {
        let key = args
            .first()
            .ok_or_else(|| Error::WrongArity("type".into()))?;
        let name = self.keyspace.lock().unwrap().type_of(key);
        Ok(vec![Message::SimpleString(name.into())])
    }

    fn config_get(&self, args: &[String]) -> Result<Vec<Message>> {
        if args.len() < 2 || !args[0].eq_ignore_ascii_case("get") {
            return Err(Error::WrongArity("config".into()));
        }
        let name = &args[1];
        let value = match name.as_str() {
            "dir" => self.config.dir.clone(),
            "dbfilename" => self.config.dbfilename.clone(),
            _ => None,
        };
        Ok(vec![match value {
            Some(value) => Message::Array(vec![
                Message::BulkString(name.clone()),
                Message::BulkString(value),
            ]),
            None => Message::Array(Vec::new()),
        }])
    }

    fn info(&self, args: &[String]) -> Vec<Message> {
        if args
            .first()
            .map(|s| s.eq_ignore_ascii_case("replication"))
            .unwrap_or(false)
        {
            let text = format!(
                "role:{}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}",
                self.role,
                self.replication.replid(),
                self.replication.master_offset(),
            );
            vec![Message::BulkString(text)]
        } else {
            vec![Message::NullBulkString]
        }
    }

    fn xadd(&self, args: &[String]) -> Result<Vec<Message>> {
        // key, id, then at least one field/value pair
        if args.len() < 4 || args.len() % 2 != 0 {
            return Err(Error::WrongArity("xadd".into()));
        }
        let fields = args[2..]
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        let id = self
            .keyspace
            .lock()
            .unwrap()
            .xadd(&args[0], &args[1], fields)?;
        Ok(vec![Message::BulkString(id.to_string())])
    }

    fn xrange(&self, args: &[String]) -> Result<Vec<Message>> {
        if args.len() < 3 {
            return Err(Error::WrongArity("xrange".into()));
        }
        let items = self
            .keyspace
            .lock()
            .unwrap()
            .xrange(&args[0], &args[1], &args[2])?;
        Ok(vec![Message::Array(
            items.iter().map(encode_stream_item).collect(),
        )])
    }

    async fn xread(&self, args: &[String]) -> Result<Vec<Message>> {
        let mut rest = &args[..];
        let mut block_ms = None;
        if rest
            .first()
            .map(|s| s.eq_ignore_ascii_case("block"))
            .unwrap_or(false)
        {
            let ms = rest
                .get(1)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidCommand("timeout is not an integer".into()))?;
            block_ms = Some(ms);
            rest = &rest[2..];
        }
        if !rest
            .first()
            .map(|s| s.eq_ignore_ascii_case("streams"))
            .unwrap_or(false)
        {
            return Err(Error::WrongArity("xread".into()));
        }
        rest = &rest[1..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(Error::WrongArity("xread".into()));
        }

        let count = rest.len() / 2;
        let keys = &rest[..count];
        let ids = &rest[count..];

        // Read positions resolve once, at call time
        let mut positions = Vec::with_capacity(count);
        {
            let mut keyspace = self.keyspace.lock().unwrap();
            for (key, id) in keys.iter().zip(ids) {
                let after = if id == "$" {
                    keyspace.last_stream_id(key)
                } else {
                    StreamId::parse(id)?
                };
                positions.push((key.clone(), after));
            }
        }

        let deadline = block_ms.and_then(|ms| {
            (ms > 0).then(|| tokio::time::Instant::now() + Duration::from_millis(ms))
        });
        loop {
            let mut streams = Vec::new();
            {
                let mut keyspace = self.keyspace.lock().unwrap();
                for (key, after) in &positions {
                    let items = keyspace.read_after(key, *after);
                    if !items.is_empty() {
                        streams.push(Message::Array(vec![
                            Message::BulkString(key.clone()),
                            Message::Array(items.iter().map(encode_stream_item).collect()),
                        ]));
                    }
                }
            }
            if !streams.is_empty() {
                return Ok(vec![Message::Array(streams)]);
            }
            match block_ms {
                None => return Ok(vec![Message::NullBulkString]),
                Some(_) => {
                    if let Some(deadline) = deadline {
                        if tokio::time::Instant::now() >= deadline {
                            return Ok(vec![Message::NullBulkString]);
                        }
                    }
                    tokio::time::sleep(XREAD_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn wait(&self, args: &[String]) -> Result<Vec<Message>> {
        if args.len() < 2 {
            return Err(Error::WrongArity("wait".into()));
        }
        let numreplicas = args[0]
            .parse::<usize>()
            .map_err(|_| Error::InvalidCommand("value is not an integer".into()))?;
        let timeout_ms = args[1]
            .parse::<u64>()
            .map_err(|_| Error::InvalidCommand("value is not an integer".into()))?;
        let count = self.replication.wait(numreplicas, timeout_ms).await;
        Ok(vec![Message::Integer(count as i64)])
    }

    fn replconf(&self, args: &[String], client: &ClientHandle) -> Result<Vec<Message>> {
        let sub = args.first().map(|s| s.to_ascii_lowercase());
        match sub.as_deref() {
            Some("ack") => {
                let offset = args
                    .get(1)
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::WrongArity("replconf".into()))?;
                self.replication.record_ack(client.id, offset);
                // ACKs are consumed silently
                Ok(Vec::new())
            }
            Some("getack") => {
                let offset = client.repl_offset.load(Ordering::SeqCst);
                Ok(vec![Message::command(&[
                    "REPLCONF",
                    "ACK",
                    &offset.to_string(),
                ])])
            }
            // listening-port and capa just acknowledge; the replica link is
            // only registered once PSYNC completes
            _ => Ok(vec![Message::SimpleString("OK".into())]),
        }
    }

    /// Master side of the resync handshake. Writes the FULLRESYNC header
    /// and the snapshot payload directly so no propagated command can
    /// slip in between, then registers the replica link.
    async fn psync(&self, args: &[String], client: &ClientHandle) -> Result<Vec<Message>> {
        let requested = args
            .get(1)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1);
        let initial_offset = requested.max(0) as u64;

        let header = Message::SimpleString(format!(
            "FULLRESYNC {} {}",
            self.replication.replid(),
            self.replication.master_offset(),
        ));
        let payload = Message::RawPayload(crate::rdb::empty_snapshot());
        {
            let mut writer = client.writer.lock().await;
            writer.write_all(&header.to_bytes()).await?;
            writer.write_all(&payload.to_bytes()).await?;
            writer.flush().await?;
        }
        self.replication.register(ReplicaLink::new(
            client.id,
            client.writer.clone(),
            initial_offset,
        ));
        Ok(Vec::new())
    }
}

fn parse_command(values: &[Message]) -> Result<(String, Vec<String>)> {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        let part = value.as_bulk().ok_or_else(|| {
            Error::InvalidCommand("command arguments must be bulk strings".into())
        })?;
        parts.push(part.to_string());
    }
    let verb = parts
        .first()
        .ok_or_else(|| Error::InvalidCommand("empty command".into()))?
        .to_uppercase();
    Ok((verb, parts[1..].to_vec()))
}

fn echo(args: &[String]) -> Result<Vec<Message>> {
    let arg = args
        .first()
        .ok_or_else(|| Error::WrongArity("echo".into()))?;
    Ok(vec![Message::BulkString(arg.clone())])
}

/// `[id, [field, value, field, value, ...]]`
fn encode_stream_item(item: &StreamItem) -> Message {
    let mut flat = Vec::with_capacity(item.fields.len() * 2);
    for (name, value) in &item.fields {
        flat.push(Message::BulkString(name.clone()));
        flat.push(Message::BulkString(value.clone()));
    }
    Message::Array(vec![
        Message::BulkString(item.id.to_string()),
        Message::Array(flat),
    ])
}
