//! Request multiplexer.
//!
//! Many callers share one connection. Each request gets a fresh sync and a
//! pending entry; a writer task drains an outbound queue onto the socket and
//! a reader task routes every response to the pending entry with the same
//! sync.
//!
//! ```text
//!  execute() --frame--> [outbound queue] --> writer task --> socket
//!      ^                                                       |
//!      +---- oneshot <---- pending table <---- reader task <---+
//! ```
//!
//! The pending table is split into shards, each behind its own lock. A
//! semaphore bounds the number of requests awaiting a response; a caller
//! past the bound waits for a slot, so a slow reader slows callers down
//! instead of growing the table without limit.

use crate::connection::{BoxReader, BoxWriter, Connection, ConnectionConfig};
use crate::error::ClientError;
use iproto_protocol::{Frame, FramePool, FrameReader, FrameWriter, Greeting, Query, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Number of independently locked pending-table shards.
const PENDING_SHARDS: usize = 16;

/// Allocates request syncs.
///
/// Syncs increase by one and wrap around, skipping zero. A sync can only
/// collide with a request that has been outstanding for 2^32 - 1 requests.
#[derive(Debug)]
pub struct SyncGenerator(AtomicU32);

impl SyncGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(sync: u32) -> Self {
        Self(AtomicU32::new(sync))
    }

    pub fn next(&self) -> u32 {
        loop {
            let sync = self.0.fetch_add(1, Ordering::Relaxed);
            if sync != 0 {
                return sync;
            }
        }
    }
}

impl Default for SyncGenerator {
    fn default() -> Self {
        Self::new()
    }
}

type Reply = oneshot::Sender<Result<Response, ClientError>>;

/// A request awaiting its response. Holds one in-flight slot until dropped.
struct Pending {
    reply: Reply,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Shard {
    requests: HashMap<u32, Pending>,
    closed: bool,
}

struct PendingTable {
    shards: Vec<Mutex<Shard>>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            shards: (0..PENDING_SHARDS).map(|_| Mutex::default()).collect(),
        }
    }

    fn shard(&self, sync: u32) -> &Mutex<Shard> {
        &self.shards[sync as usize % PENDING_SHARDS]
    }

    /// Registers a pending request. A request already registered under the
    /// same sync is completed with [`ClientError::Superseded`].
    fn register(&self, sync: u32, pending: Pending) -> Result<(), ClientError> {
        let mut shard = self.shard(sync).lock();
        if shard.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if let Some(old) = shard.requests.insert(sync, pending) {
            tracing::warn!("Request sync={} superseded by a newer request", sync);
            let _ = old.reply.send(Err(ClientError::Superseded { sync }));
        }
        Ok(())
    }

    fn take(&self, sync: u32) -> Option<Pending> {
        self.shard(sync).lock().requests.remove(&sync)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().requests.len()).sum()
    }

    /// Closes every shard to new requests and drains what is pending.
    fn close(&self) -> Vec<Pending> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.closed = true;
            drained.extend(shard.requests.drain().map(|(_, pending)| pending));
        }
        drained
    }
}

/// State shared by callers and the background tasks.
struct Shared {
    pending: PendingTable,
    syncs: SyncGenerator,
    pool: Arc<FramePool>,
    in_flight: Arc<Semaphore>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops both tasks and fails every pending request. Idempotent.
    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Multiplexer shutting down: {}", reason);
        self.shutdown.send_replace(true);
        self.in_flight.close();

        let drained = self.pending.close();
        tracing::debug!("Failing {} pending requests", drained.len());
        for pending in drained {
            let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
        }
    }
}

/// Drops the pending entry for `sync` when a caller abandons its request.
///
/// Once disarmed the entry is left alone, since it has either been settled
/// already or may belong to a newer request under the same sync.
struct PendingGuard {
    shared: Arc<Shared>,
    sync: u32,
    armed: bool,
}

impl PendingGuard {
    fn new(shared: Arc<Shared>, sync: u32) -> Self {
        Self {
            shared,
            sync,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.shared.pending.take(self.sync).is_some() {
            tracing::debug!("Request sync={} abandoned by its caller", self.sync);
        }
    }
}

/// Shares one connection between concurrent callers.
pub struct Multiplexer {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    request_timeout: Duration,
    greeting: Greeting,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Connects, authenticates and starts multiplexing.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self::start(conn))
    }

    /// Takes over an established connection and spawns the reader and
    /// writer tasks. Must be called from within a tokio runtime.
    pub fn start(conn: Connection) -> Self {
        let parts = conn.into_parts();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: PendingTable::new(),
            syncs: parts.syncs,
            pool: parts.reader.pool().clone(),
            in_flight: Arc::new(Semaphore::new(parts.config.max_in_flight.max(1))),
            closed: AtomicBool::new(false),
            shutdown,
        });

        let (outbound, queue) = mpsc::channel(parts.config.outbound_queue.max(1));
        let writer = tokio::spawn(write_loop(
            shared.clone(),
            parts.writer,
            queue,
            shared.shutdown.subscribe(),
        ));
        let reader = tokio::spawn(read_loop(
            shared.clone(),
            parts.reader,
            shared.shutdown.subscribe(),
        ));
        tracing::debug!("Multiplexer started");

        Self {
            shared,
            outbound,
            request_timeout: parts.config.effective_request_timeout(),
            greeting: parts.greeting,
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    /// Sends `query` and waits up to `timeout` for its response.
    ///
    /// The request resolves exactly once: with its response (which may carry
    /// a server error), or with a local error such as
    /// [`ClientError::Timeout`] or [`ClientError::ConnectionClosed`]. The
    /// timeout also covers waiting for an in-flight slot.
    pub async fn execute(&self, query: &Query, timeout: Duration) -> Result<Response, ClientError> {
        let deadline = Instant::now() + timeout;
        if self.shared.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let permit = match tokio::time::timeout_at(
            deadline,
            self.shared.in_flight.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Timed out waiting for an in-flight slot");
                return Err(ClientError::Timeout);
            }
        };

        let sync = self.shared.syncs.next();
        let mut frame = self.shared.pool.acquire();
        if let Err(e) = frame.encode_query(sync, query) {
            self.shared.pool.release(frame);
            return Err(e.into());
        }

        let (tx, mut rx) = oneshot::channel();
        if let Err(e) = self.shared.pending.register(
            sync,
            Pending {
                reply: tx,
                _permit: permit,
            },
        ) {
            self.shared.pool.release(frame);
            return Err(e);
        }
        // Removes the entry if this future is dropped before it settles.
        let guard = PendingGuard::new(self.shared.clone(), sync);

        match tokio::time::timeout_at(deadline, self.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(mpsc::error::SendError(frame))) => {
                self.shared.pool.release(frame);
                self.shared.pending.take(sync);
                guard.disarm();
                return Err(ClientError::ConnectionClosed);
            }
            Err(_) => {
                self.shared.pending.take(sync);
                guard.disarm();
                tracing::debug!("Request sync={} timed out before it was sent", sync);
                return Err(ClientError::Timeout);
            }
        }
        tracing::debug!("Request sync={} code={:#x} queued", sync, query.code());

        let result = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                // Whoever removes the entry decides the outcome.
                if self.shared.pending.take(sync).is_some() {
                    tracing::debug!("Request sync={} timed out", sync);
                    Err(ClientError::Timeout)
                } else {
                    rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
                }
            }
        };
        guard.disarm();
        result
    }

    /// Sends `query` with the configured request timeout.
    pub async fn request(&self, query: &Query) -> Result<Response, ClientError> {
        self.execute(query, self.request_timeout).await
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Frame pool counters.
    pub fn pool_stats(&self) -> iproto_protocol::PoolStats {
        self.shared.pool.stats()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shuts down, failing pending requests, and waits for both tasks.
    pub async fn close(&self) {
        self.shared.shutdown("closed by caller");
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("Multiplexer closed");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown("multiplexer dropped");
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: FrameWriter<BoxWriter>,
    mut queue: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("write_loop started");
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = writer.write_frame(&frame).await;
        shared.pool.release(frame);
        if let Err(e) = result {
            tracing::warn!("write_loop: write failed: {}", e);
            shared.shutdown("write failed");
            break;
        }
    }

    queue.close();
    while let Ok(frame) = queue.try_recv() {
        shared.pool.release(frame);
    }
    let _ = writer.shutdown().await;
    tracing::debug!("write_loop stopped");
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader<BoxReader>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("read_loop started");
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.read_frame() => match result {
                Ok(frame) => frame,
                Err(e) if e.is_eof() => {
                    tracing::debug!("read_loop: connection closed by peer");
                    shared.shutdown("connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!("read_loop: read failed: {}", e);
                    shared.shutdown("read failed");
                    break;
                }
            },
        };

        let decoded = Response::from_frame(&frame);
        reader.release(frame);
        let response = match decoded {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("read_loop: undecodable response: {}", e);
                shared.shutdown("undecodable response");
                break;
            }
        };

        match shared.pending.take(response.sync) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(response));
            }
            None => {
                tracing::debug!(
                    "read_loop: no pending request for sync={}, discarding",
                    response.sync
                );
            }
        }
    }
    tracing::debug!("read_loop stopped");
}
