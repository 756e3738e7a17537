//! Connection setup: connect, greeting, authentication.

use crate::error::ClientError;
use crate::mux::SyncGenerator;
use iproto_protocol::greeting::scramble;
use iproto_protocol::pool::DEFAULT_POOL_CAPACITY;
use iproto_protocol::{
    Frame, FramePool, FrameReader, FrameWriter, Greeting, Payload, Query, Response,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default request timeout, also used when a zero timeout is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on requests awaiting a response.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4096;

/// Default depth of the outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Type-erased read half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address, `host:port`.
    pub addr: String,
    /// Connection timeout, covering TCP connect and the greeting.
    pub connect_timeout: Duration,
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// User to authenticate as. No authentication when unset.
    pub user: Option<String>,
    pub password: Option<String>,
    /// Initial buffer size of pooled frames.
    pub read_buffer_size: usize,
    /// Idle frames retained by the frame pool.
    pub pool_capacity: usize,
    /// Maximum requests awaiting a response. Callers wait for a slot beyond this.
    pub max_in_flight: usize,
    /// Depth of the queue between callers and the writer task.
    pub outbound_queue: usize,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user: None,
            password: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth.max(1);
        self
    }

    /// Request timeout to apply. A zero timeout means the default.
    pub fn effective_request_timeout(&self) -> Duration {
        if self.request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            self.request_timeout
        }
    }
}

/// An established, authenticated connection that has not yet been handed
/// to a [`Multiplexer`](crate::Multiplexer).
///
/// Requests on a bare connection are strictly sequential: one frame out,
/// then frames in. The replication session drives its connection this way.
pub struct Connection {
    config: ConnectionConfig,
    greeting: Greeting,
    reader: FrameReader<BoxReader>,
    writer: FrameWriter<BoxWriter>,
    syncs: SyncGenerator,
}

/// The pieces of a connection, taken apart for background tasks.
pub struct ConnectionParts {
    pub config: ConnectionConfig,
    pub greeting: Greeting,
    pub reader: FrameReader<BoxReader>,
    pub writer: FrameWriter<BoxWriter>,
    pub syncs: SyncGenerator,
}

impl Connection {
    /// Connects to `config.addr`, reads the greeting and authenticates.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let tcp_stream =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.addr))
                .await
                .map_err(|_| {
                    tracing::debug!("Connection timeout");
                    ClientError::Timeout
                })?
                .map_err(|e| {
                    tracing::debug!("Connection failed: {}", e);
                    ClientError::Io(e)
                })?;

        tcp_stream.set_nodelay(true).ok();
        tracing::debug!("TCP connected");

        Self::handshake(tcp_stream, config).await
    }

    /// Runs the handshake over an already open stream.
    pub async fn handshake<S>(stream: S, config: ConnectionConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);

        let greeting =
            tokio::time::timeout(config.connect_timeout, Greeting::read_from(&mut read_half))
                .await
                .map_err(|_| {
                    tracing::debug!("Greeting timeout");
                    ClientError::Timeout
                })??;
        tracing::debug!(
            "Greeting received: {} (version {:?})",
            greeting.banner,
            greeting.version
        );

        let pool = Arc::new(FramePool::new(
            config.pool_capacity,
            config.read_buffer_size,
        ));
        let reader: BoxReader = Box::new(read_half);
        let writer: BoxWriter = Box::new(write_half);

        let mut conn = Self {
            greeting,
            reader: FrameReader::new(reader, pool),
            writer: FrameWriter::new(writer),
            syncs: SyncGenerator::new(),
            config,
        };

        if let Some(user) = conn.config.user.clone() {
            let password = conn.config.password.clone().unwrap_or_default();
            tracing::debug!("Authenticating as {}...", user);
            conn.authenticate(&user, &password).await?;
            tracing::debug!("Authentication successful");
        }

        Ok(conn)
    }

    /// Authenticates with `chap-sha1` against the greeting salt.
    async fn authenticate(&mut self, user: &str, password: &str) -> Result<(), ClientError> {
        let query = Query::Auth {
            user: user.to_string(),
            scramble: scramble(&self.greeting.salt, password).to_vec(),
        };
        let frame = self.request(&query).await?;
        let response = Response::from_frame(&frame);
        self.release(frame);

        match response?.into_result() {
            Ok(_) => Ok(()),
            Err(err) => Err(ClientError::Auth(err)),
        }
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Allocates the next request sync.
    pub fn next_sync(&self) -> u32 {
        self.syncs.next()
    }

    /// Encodes and sends `query`, returning the sync it was sent with.
    pub async fn send(&mut self, query: &Query) -> Result<u32, ClientError> {
        let sync = self.syncs.next();
        let mut frame = self.reader.pool().acquire();
        let result = match frame.encode_query(sync, query) {
            Ok(()) => self.writer.write_frame(&frame).await,
            Err(e) => Err(e),
        };
        self.reader.release(frame);
        result?;
        tracing::debug!("Sent request code={:#x} sync={}", query.code(), sync);
        Ok(sync)
    }

    /// Writes a prepared frame as is.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ClientError> {
        self.writer.write_frame(frame).await?;
        Ok(())
    }

    /// Reads the next frame. The caller hands it back with [`Connection::release`].
    ///
    /// An EOF surfaces as [`ClientError::ConnectionClosed`].
    pub async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        self.reader.read_frame().await.map_err(|e| {
            if e.is_eof() {
                tracing::debug!("Connection closed by peer");
                ClientError::ConnectionClosed
            } else {
                ClientError::Protocol(e)
            }
        })
    }

    pub fn release(&self, frame: Frame) {
        self.reader.release(frame);
    }

    /// Sends `query` and reads the single frame answering it.
    ///
    /// A timeout leaves the stream mid-frame; the connection must be
    /// dropped afterwards.
    pub async fn request(&mut self, query: &Query) -> Result<Frame, ClientError> {
        let sync = self.send(query).await?;
        let timeout = self.config.effective_request_timeout();

        let frame = tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| {
                tracing::debug!("Request sync={} timed out", sync);
                ClientError::Timeout
            })??;

        if frame.header.sync != sync {
            let got = frame.header.sync;
            self.release(frame);
            return Err(ClientError::UnexpectedResponse(format!(
                "expected sync {}, got {}",
                sync, got
            )));
        }
        Ok(frame)
    }

    /// Like [`Connection::request`], decoding the response and converting a
    /// server error into [`ClientError::Server`].
    pub async fn call(&mut self, query: &Query) -> Result<Response, ClientError> {
        let frame = self.request(query).await?;
        let response = Response::from_frame(&frame);
        self.release(frame);
        let response = response?;
        match response.payload {
            Payload::Error(err) => Err(ClientError::Server(err)),
            Payload::Data(_) => Ok(response),
        }
    }

    pub fn into_parts(self) -> ConnectionParts {
        ConnectionParts {
            config: self.config,
            greeting: self.greeting,
            reader: self.reader,
            writer: self.writer,
            syncs: self.syncs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iproto_protocol::keys::errcode;
    use iproto_protocol::ServerError;
    use iproto_protocol::Value;

    fn frame_bytes(frame: &Frame) -> Vec<u8> {
        frame.to_vec().unwrap()
    }

    const SALT: [u8; 32] = [9u8; 32];

    fn greeting() -> [u8; iproto_protocol::GREETING_SIZE] {
        Greeting::build("Tarantool 2.10.4 (Binary)", &SALT)
    }

    fn auth_bytes(sync: u32, user: &str, password: &str) -> Vec<u8> {
        let query = Query::Auth {
            user: user.to_string(),
            scramble: scramble(&SALT, password).to_vec(),
        };
        frame_bytes(&Frame::from_query(sync, &query).unwrap())
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:3301");
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.user.is_none());
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new("127.0.0.1:3301").with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config =
            ConnectionConfig::new("127.0.0.1:3301").with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_zero_timeout_means_default() {
        let config = ConnectionConfig::new("x:1").with_request_timeout(Duration::ZERO);
        assert_eq!(config.effective_request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        let config = ConnectionConfig::new("x:1").with_request_timeout(Duration::from_millis(5));
        assert_eq!(config.effective_request_timeout(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_handshake_without_credentials() {
        let mock = tokio_test::io::Builder::new().read(&greeting()).build();
        let conn = Connection::handshake(mock, ConnectionConfig::new("mock"))
            .await
            .unwrap();
        assert_eq!(
            conn.greeting().version,
            Some(iproto_protocol::Version::new(2, 10, 4))
        );
    }

    #[tokio::test]
    async fn test_handshake_authenticates() {
        let ok = Response::ok(1, vec![]).to_frame().unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&greeting())
            .write(&auth_bytes(1, "admin", "secret"))
            .read(&frame_bytes(&ok))
            .build();

        let config = ConnectionConfig::new("mock").with_credentials("admin", "secret");
        let conn = Connection::handshake(mock, config).await.unwrap();
        assert_eq!(conn.next_sync(), 2);
    }

    #[tokio::test]
    async fn test_handshake_rejected_credentials() {
        let denied = Response::error(
            1,
            ServerError::new(errcode::CREDS_MISMATCH, "Incorrect password supplied"),
        )
        .to_frame()
        .unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&greeting())
            .write(&auth_bytes(1, "admin", "wrong"))
            .read(&frame_bytes(&denied))
            .build();

        let config = ConnectionConfig::new("mock").with_credentials("admin", "wrong");
        match Connection::handshake(mock, config).await {
            Err(ClientError::Auth(err)) => assert_eq!(err.code, errcode::CREDS_MISMATCH),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("authentication should fail"),
        }
    }

    #[tokio::test]
    async fn test_truncated_greeting() {
        let raw = greeting();
        let mock = tokio_test::io::Builder::new().read(&raw[..40]).build();
        let result = Connection::handshake(mock, ConnectionConfig::new("mock")).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_request_checks_sync() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server = server;
        tokio::io::AsyncWriteExt::write_all(&mut server, &greeting())
            .await
            .unwrap();
        let mut conn = Connection::handshake(client, ConnectionConfig::new("duplex"))
            .await
            .unwrap();

        let server_task = tokio::spawn(async move {
            let pool = Arc::new(FramePool::new(2, 64));
            let (read_half, write_half) = tokio::io::split(server);
            let mut reader = FrameReader::new(read_half, pool);
            let mut writer = FrameWriter::new(write_half);
            let request = reader.read_frame().await.unwrap();
            let reply = Response::ok(
                request.header.sync,
                vec![vec![Value::from("pong")]],
            );
            writer.write_frame(&reply.to_frame().unwrap()).await.unwrap();

            let _second = reader.read_frame().await.unwrap();
            let stray = Response::ok(999, vec![]);
            writer.write_frame(&stray.to_frame().unwrap()).await.unwrap();
        });

        let response = conn
            .call(&Query::Eval {
                expr: "return 'pong'".to_string(),
                args: vec![],
            })
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), vec![vec![Value::from("pong")]]);

        let result = conn.request(&Query::Ping).await;
        assert!(matches!(result, Err(ClientError::UnexpectedResponse(_))));
        server_task.await.unwrap();
    }
}
