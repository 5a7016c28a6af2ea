//! End-to-end replication: handshake, propagation, offsets, WAIT

use miniredis::common::MasterAddr;
use miniredis::resp::{Message, RespParser};
use miniredis::{Config, Server};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Grab a free port, then start a server on it in the background and
/// wait until it accepts connections.
async fn spawn_server(config: Config) -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let server = Server::new(Config { port, ..config });
    tokio::spawn(async move {
        let _ = server.serve().await;
    });

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return port;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server on port {} never came up", port);
}

struct Conn {
    parser: RespParser<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn open(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            parser: RespParser::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, parts: &[&str]) {
        self.writer
            .write_all(&Message::command(parts).to_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        self.parser.read_message().await.unwrap().unwrap()
    }

    async fn roundtrip(&mut self, parts: &[&str]) -> Message {
        self.send(parts).await;
        self.recv().await
    }
}

/// Walk the replica side of the handshake by hand so each reply can be
/// inspected. Returns the connection with the link established.
async fn handshake_as_replica(port: u16) -> Conn {
    let mut conn = Conn::open(port).await;

    assert_eq!(
        conn.roundtrip(&["PING"]).await,
        Message::SimpleString("PONG".into())
    );
    assert_eq!(
        conn.roundtrip(&["REPLCONF", "listening-port", "6380"]).await,
        Message::SimpleString("OK".into())
    );
    assert_eq!(
        conn.roundtrip(&["REPLCONF", "capa", "psync2"]).await,
        Message::SimpleString("OK".into())
    );

    conn.send(&["PSYNC", "?", "-1"]).await;
    let Message::SimpleString(header) = conn.recv().await else {
        panic!("expected FULLRESYNC header");
    };
    let parts: Vec<_> = header.split_whitespace().collect();
    assert_eq!(parts[0], "FULLRESYNC");
    assert_eq!(parts[1].len(), 40);
    assert_eq!(parts[2], "0");

    let Message::RawPayload(snapshot) = conn.recv().await else {
        panic!("expected inline snapshot payload");
    };
    assert!(snapshot.starts_with(b"REDIS"));

    conn
}

#[tokio::test]
async fn test_full_resync_propagation_and_wait() {
    let port = spawn_server(Config::default()).await;
    let mut replica = handshake_as_replica(port).await;
    let mut client = Conn::open(port).await;

    // A freshly synced replica is already caught up
    assert_eq!(
        client.roundtrip(&["WAIT", "1", "100"]).await,
        Message::Integer(1)
    );

    // Writes reach the replica verbatim
    let set = Message::command(&["SET", "foo", "bar"]);
    assert_eq!(
        client.roundtrip(&["SET", "foo", "bar"]).await,
        Message::SimpleString("OK".into())
    );
    assert_eq!(replica.recv().await, set);

    // WAIT probes the lagging replica; answer the probe and the count
    // comes back up
    client.send(&["WAIT", "1", "1000"]).await;
    assert_eq!(
        replica.recv().await,
        Message::command(&["REPLCONF", "GETACK", "*"])
    );
    let offset = set.encoded_len().to_string();
    replica.send(&["REPLCONF", "ACK", &offset]).await;
    assert_eq!(client.recv().await, Message::Integer(1));

    // The master offset advanced by exactly the propagated bytes
    let Message::BulkString(info) = client.roundtrip(&["INFO", "replication"]).await else {
        panic!("expected bulk string");
    };
    assert!(info.contains(&format!("master_repl_offset:{}", set.encoded_len())));
}

#[tokio::test]
async fn test_wait_times_out_when_replica_stays_silent() {
    let port = spawn_server(Config::default()).await;
    let mut replica = handshake_as_replica(port).await;
    let mut client = Conn::open(port).await;

    client.roundtrip(&["SET", "k", "v"]).await;
    replica.recv().await;

    let start = std::time::Instant::now();
    assert_eq!(
        client.roundtrip(&["WAIT", "1", "100"]).await,
        Message::Integer(0)
    );
    assert!(start.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_replica_server_serves_propagated_writes() {
    let master_port = spawn_server(Config::default()).await;
    let replica_port = spawn_server(Config {
        replicaof: Some(MasterAddr {
            host: "127.0.0.1".into(),
            port: master_port,
        }),
        ..Default::default()
    })
    .await;

    let mut replica_client = Conn::open(replica_port).await;
    let Message::BulkString(info) = replica_client.roundtrip(&["INFO", "replication"]).await
    else {
        panic!("expected bulk string");
    };
    assert!(info.contains("role:slave"));

    let mut master_client = Conn::open(master_port).await;
    // Give the background handshake time to register the link
    for _ in 0..100 {
        if master_client.roundtrip(&["WAIT", "1", "10"]).await == Message::Integer(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    master_client.roundtrip(&["SET", "foo", "bar"]).await;

    let mut value = Message::NullBulkString;
    for _ in 0..100 {
        value = replica_client.roundtrip(&["GET", "foo"]).await;
        if value != Message::NullBulkString {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(value, Message::BulkString("bar".into()));

    // The replica acknowledges offsets on demand, so WAIT succeeds on
    // the master even after the write
    assert_eq!(
        master_client.roundtrip(&["WAIT", "1", "1000"]).await,
        Message::Integer(1)
    );
}
