//! Scripted in-memory server for session tests.

use crate::config::ReplicaConfig;
use crate::error::ReplicationError;
use crate::session::Session;
use iproto_client::{Connection, ConnectionConfig};
use iproto_protocol::keys::{body, code};
use iproto_protocol::query::{vclock_value, VclockMap};
use iproto_protocol::value::map_value;
use iproto_protocol::{Frame, FramePool, FrameReader, FrameWriter, Greeting, Header, Query, Value};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const BANNER: &str = "Tarantool 2.10.4 (Binary) 0d5bd431-7f3e-4695-a5c2-82de547ba22a";

pub const U1: Uuid = Uuid::from_u128(0x0000_0001_0000_4000_8000_0000_0000_0001);
pub const U2: Uuid = Uuid::from_u128(0x0000_0002_0000_4000_8000_0000_0000_0002);
pub const UA: Uuid = Uuid::from_u128(0x0000_000a_0000_4000_8000_0000_0000_000a);
pub const UB: Uuid = Uuid::from_u128(0x0000_000b_0000_4000_8000_0000_0000_000b);

pub fn config() -> ReplicaConfig {
    ReplicaConfig::new(ConnectionConfig::new("scripted"))
}

pub fn vclock(pairs: &[(u32, u64)]) -> Value {
    vclock_value(&pairs.iter().copied().collect::<VclockMap>())
}

/// The server end of a session under test.
pub struct ScriptedServer {
    pub reader: FrameReader<ReadHalf<DuplexStream>>,
    pub writer: FrameWriter<WriteHalf<DuplexStream>>,
    last_sync: u32,
}

impl ScriptedServer {
    /// Reads the next request, checks its code and decodes it.
    pub async fn expect(&mut self, expected: u32) -> Query {
        let frame = self.reader.read_frame().await.unwrap();
        assert_eq!(frame.header.code, expected, "unexpected request code");
        self.last_sync = frame.header.sync;
        let query = Query::decode(frame.header.code, frame.body()).unwrap();
        self.reader.release(frame);
        query
    }

    async fn send(&mut self, header: Header, body: Value) {
        let mut frame = Frame::new();
        frame.header = header;
        frame.set_body_value(&body).unwrap();
        self.writer.write_frame(&frame).await.unwrap();
    }

    /// Sends `OK` answering the last request.
    pub async fn ok(&mut self, fields: Vec<(u64, Value)>) {
        self.ok_value(map_value(fields)).await
    }

    pub async fn ok_value(&mut self, body: Value) {
        self.send(Header::new(code::OK, self.last_sync), body).await
    }

    /// Sends `OK` under an explicit sync.
    pub async fn ok_with_sync(&mut self, sync: u32, fields: Vec<(u64, Value)>) {
        self.send(Header::new(code::OK, sync), map_value(fields)).await
    }

    pub fn last_sync(&self) -> u32 {
        self.last_sync
    }

    pub async fn error(&mut self, errcode: u32, message: &str, mut fields: Vec<(u64, Value)>) {
        fields.push((body::ERROR, Value::from(message)));
        self.send(
            Header::new(code::ERROR_FLAG | errcode, self.last_sync),
            map_value(fields),
        )
        .await
    }

    /// Sends a snapshot row without a log position.
    pub async fn row(&mut self, request: u32, space: u32, tuple: Vec<Value>) {
        let body = map_value(vec![
            (body::SPACE_ID, Value::from(space)),
            (body::TUPLE, Value::Array(tuple)),
        ]);
        self.send(Header::new(request, 0), body).await
    }

    /// Sends a change stream `INSERT` from `replica_id` at `lsn`.
    pub async fn entry(&mut self, replica_id: u32, lsn: u64, space: u32, tuple: Vec<Value>) {
        let header = Header {
            replica_id: Some(replica_id),
            lsn: Some(lsn),
            timestamp: Some(1_700_000_000.5),
            ..Header::new(code::INSERT, 0)
        };
        let body = map_value(vec![
            (body::SPACE_ID, Value::from(space)),
            (body::TUPLE, Value::Array(tuple)),
        ]);
        self.send(header, body).await
    }

    pub async fn nop(&mut self, replica_id: u32, lsn: u64) {
        let header = Header {
            replica_id: Some(replica_id),
            lsn: Some(lsn),
            ..Header::new(code::NOP, 0)
        };
        self.send(header, map_value(vec![])).await
    }
}

/// Connects a session to a scripted server announcing `banner`.
pub async fn try_session(
    banner: &str,
    config: ReplicaConfig,
) -> (Result<Session, ReplicationError>, ScriptedServer) {
    try_session_with_buffer(banner, config, 64 * 1024).await
}

/// Like [`try_session`], with `buffer` bytes of room in each direction.
pub async fn try_session_with_buffer(
    banner: &str,
    config: ReplicaConfig,
    buffer: usize,
) -> (Result<Session, ReplicationError>, ScriptedServer) {
    let (client, mut server) = tokio::io::duplex(buffer);
    server
        .write_all(&Greeting::build(banner, &[5u8; 32]))
        .await
        .unwrap();
    let conn = Connection::handshake(client, config.connection.clone())
        .await
        .unwrap();

    let (read_half, write_half) = tokio::io::split(server);
    let server = ScriptedServer {
        reader: FrameReader::new(read_half, Arc::new(FramePool::new(4, 256))),
        writer: FrameWriter::new(write_half),
        last_sync: 0,
    };
    (Session::with_connection(conn, config), server)
}

pub async fn session(banner: &str, config: ReplicaConfig) -> (Session, ScriptedServer) {
    let (session, server) = try_session(banner, config).await;
    (session.unwrap(), server)
}

/// Runs `subscribe` in the background so the test can play the server.
pub fn spawn_subscribe(mut session: Session) -> JoinHandle<Result<Session, ReplicationError>> {
    tokio::spawn(async move {
        session.subscribe().await?;
        Ok(session)
    })
}
