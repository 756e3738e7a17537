//! Replication session: join, subscribe and the change stream.
//!
//! A session owns its connection exclusively. Frames are pulled one at a
//! time by [`Session::next`]; what a frame means depends on the phase the
//! session is in.

use crate::ballot::Ballot;
use crate::config::{ReplicaConfig, MIN_ANONYMOUS_VERSION};
use crate::directory::Directory;
use crate::entry::{Entry, Origin};
use crate::error::ReplicationError;
use crate::vclock::VectorClock;
use iproto_client::connection::{BoxReader, BoxWriter};
use iproto_client::{ClientError, Connection, SyncGenerator};
use iproto_protocol::keys::{self, body, code};
use iproto_protocol::query::{decode_vclock, vclock_value};
use iproto_protocol::value::{self, map_value};
use iproto_protocol::{
    Frame, FrameReader, FrameWriter, Greeting, Header, ProtocolError, Query, ServerError, Value,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    /// Greeting read and authenticated; `vote`, `join` and `subscribe` allowed.
    Connected,
    /// Join sent; [`Session::next`] yields snapshot rows.
    Joining,
    /// Join finished; ready to subscribe.
    Joined,
    Subscribing,
    /// Subscribed; [`Session::next`] yields change stream entries.
    Streaming,
    Closed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }
}

/// Result of handling one join-phase frame.
enum JoinStep {
    Row(Entry),
    Continue,
    Done,
}

/// The session's end of the connection.
struct Link {
    reader: FrameReader<BoxReader>,
    /// Taken by the heartbeat task once an anonymous session streams.
    writer: Option<FrameWriter<BoxWriter>>,
    syncs: SyncGenerator,
    request_timeout: Duration,
}

impl Link {
    fn new(conn: Connection) -> Self {
        let parts = conn.into_parts();
        Self {
            reader: parts.reader,
            writer: Some(parts.writer),
            syncs: parts.syncs,
            request_timeout: parts.config.effective_request_timeout(),
        }
    }

    /// Writes `query` under a fresh sync and returns that sync.
    async fn send(&mut self, query: &Query) -> Result<u32, ReplicationError> {
        let writer = self.writer.as_mut().ok_or(ClientError::ConnectionClosed)?;
        let sync = self.syncs.next();
        let mut frame = self.reader.pool().acquire();
        let result = match frame.encode_query(sync, query) {
            Ok(()) => writer.write_frame(&frame).await,
            Err(e) => Err(e),
        };
        self.reader.release(frame);
        result?;
        tracing::debug!("Sent {} sync={}", query_name(query), sync);
        Ok(sync)
    }

    async fn read(&mut self) -> Result<Frame, ReplicationError> {
        self.reader.read_frame().await.map_err(|e| {
            if e.is_eof() {
                ReplicationError::Client(ClientError::ConnectionClosed)
            } else {
                ReplicationError::Protocol(e)
            }
        })
    }

    async fn read_timeout(&mut self) -> Result<Frame, ReplicationError> {
        let timeout = self.request_timeout;
        tokio::time::timeout(timeout, self.read())
            .await
            .map_err(|_| ReplicationError::Client(ClientError::Timeout))?
    }
}

fn query_name(query: &Query) -> &'static str {
    match query {
        Query::Join { .. } => "JOIN",
        Query::FetchSnapshot => "FETCH_SNAPSHOT",
        Query::Subscribe { .. } => "SUBSCRIBE",
        Query::Vote => "VOTE",
        _ => "request",
    }
}

/// Extracts the server error carried by an error frame.
fn server_error(frame: &Frame) -> Result<ServerError, ProtocolError> {
    let map = frame.body_map()?;
    let message = value::opt_str(&map, body::ERROR)?.unwrap_or_default();
    Ok(ServerError::new(
        frame.header.code & code::ERROR_CODE_MASK,
        message,
    ))
}

/// A replication follower session.
///
/// Entries are pulled with [`Session::next`], or pushed into a bounded queue
/// by [`Session::into_stream`]. The first terminal error moves the session to
/// [`Phase::Failed`]; every later call reports [`ReplicationError::Failed`].
pub struct Session {
    config: ReplicaConfig,
    phase: Phase,
    link: Option<Link>,
    greeting: Option<Greeting>,
    directory: Directory,
    vclock: VectorClock,
    vclock_tx: watch::Sender<VectorClock>,
    master_vclock: Option<VectorClock>,
    instance_id: Option<u32>,
    join_rows: u64,
    join_acked: bool,
    last_header: Option<Header>,
    failure: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Session {
    /// Creates a session without connecting.
    pub fn new(config: ReplicaConfig) -> Self {
        let (vclock_tx, _) = watch::channel(config.vclock.clone());
        Self {
            directory: Directory::new(config.replicaset_uuid),
            vclock: config.vclock.clone(),
            vclock_tx,
            phase: Phase::Disconnected,
            link: None,
            greeting: None,
            master_vclock: None,
            instance_id: None,
            join_rows: 0,
            join_acked: false,
            last_header: None,
            failure: None,
            heartbeat: None,
            config,
        }
    }

    /// Creates a session and connects it.
    pub async fn connect(config: ReplicaConfig) -> Result<Self, ReplicationError> {
        let mut session = Self::new(config);
        session.open().await?;
        Ok(session)
    }

    /// Creates a session over an already established connection.
    pub fn with_connection(
        conn: Connection,
        config: ReplicaConfig,
    ) -> Result<Self, ReplicationError> {
        let mut session = Self::new(config);
        session.adopt(conn)?;
        Ok(session)
    }

    /// Connects to the configured server: TCP, greeting, authentication.
    pub async fn open(&mut self) -> Result<(), ReplicationError> {
        self.expect_phase("open", &[Phase::Disconnected])?;
        match Connection::connect(self.config.connection.clone()).await {
            Ok(conn) => self.adopt(conn),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn adopt(&mut self, conn: Connection) -> Result<(), ReplicationError> {
        let greeting = conn.greeting().clone();
        if self.config.anonymous && !greeting.supports(MIN_ANONYMOUS_VERSION) {
            let actual = greeting
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(self.fail(ReplicationError::UnsupportedVersion {
                feature: "anonymous replicas",
                required: MIN_ANONYMOUS_VERSION,
                actual,
            }));
        }

        tracing::debug!(
            "Replication session connected to {} as {}",
            greeting.banner,
            self.config.instance_uuid
        );
        self.greeting = Some(greeting);
        self.link = Some(Link::new(conn));
        self.phase = Phase::Connected;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn instance_uuid(&self) -> Uuid {
        self.config.instance_uuid
    }

    /// Instance id assigned to this replica, once seen during join.
    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    pub fn is_anonymous(&self) -> bool {
        self.config.anonymous
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Position consumed so far.
    pub fn vclock(&self) -> &VectorClock {
        &self.vclock
    }

    /// Receiver of vector clock snapshots, updated after every entry.
    pub fn watch_vclock(&self) -> watch::Receiver<VectorClock> {
        self.vclock_tx.subscribe()
    }

    /// Master position reported in the subscribe acknowledgement.
    pub fn master_vclock(&self) -> Option<&VectorClock> {
        self.master_vclock.as_ref()
    }

    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Header of the last frame processed.
    pub fn last_header(&self) -> Option<&Header> {
        self.last_header.as_ref()
    }

    /// Description of the error that failed the session.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Asks the server for its ballot. Only valid before join.
    pub async fn vote(&mut self) -> Result<Ballot, ReplicationError> {
        self.expect_phase("vote", &[Phase::Connected])?;
        let frame = self.request(&Query::Vote).await?;
        let result = if frame.header.is_error() {
            server_error(&frame).map(ReplicationError::Server).map(Err)
        } else {
            frame.body_map().and_then(|map| Ballot::from_body(&map)).map(Ok)
        };
        self.release(frame);
        match result {
            Ok(outcome) => outcome,
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Starts the initial state transfer. Rows are then pulled with
    /// [`Session::next`] until it returns `None`.
    ///
    /// Registered sessions send `JOIN`; anonymous sessions fetch a snapshot
    /// instead and never register.
    pub async fn join(&mut self) -> Result<(), ReplicationError> {
        self.expect_phase("join", &[Phase::Connected])?;
        let query = if self.config.anonymous {
            Query::FetchSnapshot
        } else {
            Query::Join {
                instance_uuid: self.config.instance_uuid,
            }
        };
        self.send(&query).await?;
        self.join_rows = 0;
        self.join_acked = false;
        self.phase = Phase::Joining;
        Ok(())
    }

    /// Subscribes to the change stream from the current vector clock.
    ///
    /// Allowed after join, or straight after connecting to resume from the
    /// configured position.
    pub async fn subscribe(&mut self) -> Result<(), ReplicationError> {
        self.expect_phase("subscribe", &[Phase::Connected, Phase::Joined])?;
        self.phase = Phase::Subscribing;

        let query = Query::Subscribe {
            instance_uuid: self.config.instance_uuid,
            replicaset_uuid: self.directory.replicaset_uuid().unwrap_or_else(Uuid::nil),
            vclock: self.vclock.as_map().clone(),
            anon: self.config.anonymous,
            version_id: self
                .greeting
                .as_ref()
                .and_then(|g| g.version)
                .map(|v| v.id()),
        };
        tracing::debug!("Subscribing from {}", self.vclock);

        let frame = self.request(&query).await?;
        let result = self.handle_subscribe_reply(&frame);
        self.release(frame);
        if let Err(e) = result {
            return Err(self.fail(e));
        }

        self.phase = Phase::Streaming;
        if self.config.anonymous {
            self.start_heartbeat();
        }
        tracing::debug!("Streaming from {}", self.vclock);
        Ok(())
    }

    /// Joins, discards the snapshot rows, and subscribes from where the
    /// join ended. From [`Phase::Joined`] it only subscribes.
    pub async fn attach(&mut self) -> Result<(), ReplicationError> {
        if self.phase == Phase::Connected {
            self.join().await?;
        }
        if self.phase == Phase::Joining {
            let mut skipped = 0u64;
            while self.next().await?.is_some() {
                skipped += 1;
            }
            tracing::debug!("Attach skipped {} snapshot rows", skipped);
        }
        self.subscribe().await
    }

    /// Returns the next entry.
    ///
    /// While joining, yields snapshot rows and `None` once join completes.
    /// While streaming, yields change entries and `None` when the server
    /// closes the stream.
    pub async fn next(&mut self) -> Result<Option<Entry>, ReplicationError> {
        match self.phase {
            Phase::Joining => self.next_join_row().await,
            Phase::Streaming => self.next_stream_entry().await,
            Phase::Joined | Phase::Closed => Ok(None),
            Phase::Failed => Err(self.failed()),
            phase => Err(ReplicationError::InvalidPhase {
                operation: "next",
                phase,
            }),
        }
    }

    /// Closes the connection. A failed session stays failed.
    pub async fn close(&mut self) {
        self.stop_heartbeat();
        if let Some(mut link) = self.link.take() {
            if let Some(writer) = link.writer.as_mut() {
                let _ = writer.shutdown().await;
            }
        }
        if self.phase != Phase::Failed {
            self.phase = Phase::Closed;
        }
        tracing::debug!("Replication session closed");
    }

    // =========================================================================
    // Join
    // =========================================================================

    async fn next_join_row(&mut self) -> Result<Option<Entry>, ReplicationError> {
        loop {
            let frame = match self.read().await {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e)),
            };
            let step = self.handle_join_frame(&frame);
            self.release(frame);
            match step {
                Ok(JoinStep::Row(entry)) => return Ok(Some(entry)),
                Ok(JoinStep::Continue) => {}
                Ok(JoinStep::Done) => return Ok(None),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn handle_join_frame(&mut self, frame: &Frame) -> Result<JoinStep, ReplicationError> {
        self.last_header = Some(frame.header.clone());

        if let Some(errcode) = frame.header.error_code() {
            let err = server_error(frame)?;
            let already_member = self.config.already_member_code & code::ERROR_CODE_MASK;
            if !self.config.anonymous && errcode == already_member {
                tracing::debug!("Already a member of the replica set: {}", err.message);
                self.phase = Phase::Joined;
                return Ok(JoinStep::Done);
            }
            return Err(ReplicationError::Server(err));
        }

        if frame.header.code == code::OK {
            // Servers open the reply with a vclock-bearing OK of their own,
            // so a success frame ahead of any row is taken as that opening
            // ack. The next one ends the join, rows or not.
            if self.join_rows == 0 && !self.join_acked {
                tracing::debug!("Join accepted, receiving rows");
                self.join_acked = true;
                return Ok(JoinStep::Continue);
            }
            self.finish_join(frame)?;
            return Ok(JoinStep::Done);
        }

        let query = Query::decode(frame.header.code, frame.body())?;
        self.join_rows += 1;
        match &query {
            Query::Insert { space, tuple } | Query::Replace { space, tuple }
                if *space == keys::space::SCHEMA =>
            {
                self.observe_schema_row(tuple)?;
                Ok(JoinStep::Continue)
            }
            Query::Insert { space, tuple } | Query::Replace { space, tuple }
                if *space == keys::space::CLUSTER =>
            {
                self.observe_cluster_row(tuple)?;
                Ok(JoinStep::Continue)
            }
            other if matches!(other.space(), Some(keys::space::SCHEMA | keys::space::CLUSTER)) => {
                Ok(JoinStep::Continue)
            }
            _ => Ok(JoinStep::Row(Entry {
                origin: Origin::Join,
                replica_id: frame.header.replica_id.unwrap_or(0),
                lsn: frame.header.lsn.unwrap_or(0),
                timestamp: frame.header.timestamp,
                query,
            })),
        }
    }

    /// `_schema` row `["cluster", <uuid>]` names the replica set.
    fn observe_schema_row(&mut self, tuple: &[Value]) -> Result<(), ReplicationError> {
        if value::field_str(tuple, 0)? == "cluster" {
            let uuid = value::field_uuid(tuple, 1)?;
            self.directory.assert_replicaset(uuid)?;
        }
        Ok(())
    }

    /// `_cluster` row `[<id>, <uuid>]` registers an instance.
    fn observe_cluster_row(&mut self, tuple: &[Value]) -> Result<(), ReplicationError> {
        let id = u32::try_from(value::field_u64(tuple, 0)?)
            .map_err(|_| ProtocolError::ExpectedNumber(0))?;
        let uuid = value::field_uuid(tuple, 1)?;
        self.directory.insert_instance(id, uuid);
        if uuid == self.config.instance_uuid {
            tracing::debug!("Assigned instance id {}", id);
            self.instance_id = Some(id);
        }
        Ok(())
    }

    fn finish_join(&mut self, frame: &Frame) -> Result<(), ReplicationError> {
        if self.config.anonymous {
            // Anonymous replicas keep no join position.
            tracing::debug!("Snapshot fetched: {} rows", self.join_rows);
        } else {
            let map = frame.body_map()?;
            let vclock = value::get(&map, body::VCLOCK)
                .ok_or(ProtocolError::MissingField(body::VCLOCK))?;
            self.vclock = VectorClock::from(decode_vclock(vclock, body::VCLOCK)?);
            self.publish_vclock();
            tracing::debug!("Join finished: {} rows, at {}", self.join_rows, self.vclock);
        }
        self.phase = Phase::Joined;
        Ok(())
    }

    // =========================================================================
    // Subscribe / stream
    // =========================================================================

    fn handle_subscribe_reply(&mut self, frame: &Frame) -> Result<(), ReplicationError> {
        self.last_header = Some(frame.header.clone());
        let map = frame.body_map()?;
        if let Some(asserted) = value::opt_uuid(&map, body::CLUSTER_UUID)? {
            self.directory.assert_replicaset(asserted)?;
        }

        if frame.header.is_error() {
            return Err(ReplicationError::Server(server_error(frame)?));
        }
        if frame.header.code != code::OK {
            return Err(ReplicationError::UnexpectedResponse(format!(
                "code {:#x} in reply to SUBSCRIBE",
                frame.header.code
            )));
        }
        if let Some(vclock) = value::get(&map, body::VCLOCK) {
            let vclock = VectorClock::from(decode_vclock(vclock, body::VCLOCK)?);
            tracing::debug!("Master at {}", vclock);
            self.master_vclock = Some(vclock);
        }
        Ok(())
    }

    async fn next_stream_entry(&mut self) -> Result<Option<Entry>, ReplicationError> {
        loop {
            let frame = match self.read().await {
                Ok(frame) => frame,
                Err(ReplicationError::Client(ClientError::ConnectionClosed)) => {
                    tracing::debug!("Change stream closed by server");
                    self.stop_heartbeat();
                    self.link = None;
                    self.phase = Phase::Closed;
                    return Ok(None);
                }
                Err(e) => return Err(self.fail(e)),
            };
            let result = self.handle_stream_frame(&frame);
            self.release(frame);
            match result {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn handle_stream_frame(&mut self, frame: &Frame) -> Result<Option<Entry>, ReplicationError> {
        let header = &frame.header;
        self.last_header = Some(header.clone());

        if header.is_error() {
            return Err(ReplicationError::Server(server_error(frame)?));
        }
        if header.code == code::OK {
            tracing::trace!("Heartbeat from master");
            return Ok(None);
        }

        let replica_id = header
            .replica_id
            .ok_or(ProtocolError::MalformedHeader("row without replica id"))?;
        if replica_id == 0 {
            return Err(ProtocolError::MalformedHeader("replica id 0 is reserved").into());
        }
        let lsn = header
            .lsn
            .ok_or(ProtocolError::MalformedHeader("row without lsn"))?;
        let query = Query::decode(header.code, frame.body())?;

        let current = self.vclock.get(replica_id);
        if !self.vclock.follow(replica_id, lsn) {
            return Err(ReplicationError::OrderingViolation {
                replica_id,
                lsn,
                current,
            });
        }
        self.publish_vclock();

        Ok(Some(Entry {
            origin: Origin::Stream,
            replica_id,
            lsn,
            timestamp: header.timestamp,
            query,
        }))
    }

    fn start_heartbeat(&mut self) {
        let writer = match self.link.as_mut().and_then(|link| link.writer.take()) {
            Some(writer) => writer,
            None => return,
        };
        self.heartbeat = Some(tokio::spawn(heartbeat_loop(
            writer,
            self.vclock_tx.subscribe(),
            self.config.heartbeat_interval,
        )));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn expect_phase(&self, operation: &'static str, allowed: &[Phase]) -> Result<(), ReplicationError> {
        if self.phase == Phase::Failed {
            return Err(self.failed());
        }
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ReplicationError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn failed(&self) -> ReplicationError {
        ReplicationError::Failed {
            reason: self
                .failure
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    /// Moves to [`Phase::Failed`] and drops the connection.
    fn fail(&mut self, err: ReplicationError) -> ReplicationError {
        tracing::warn!("Replication failed in phase {:?}: {}", self.phase, err);
        self.phase = Phase::Failed;
        self.failure = Some(err.to_string());
        self.stop_heartbeat();
        self.link = None;
        err
    }

    fn link_mut(&mut self) -> Result<&mut Link, ReplicationError> {
        self.link
            .as_mut()
            .ok_or(ReplicationError::Client(ClientError::ConnectionClosed))
    }

    async fn send(&mut self, query: &Query) -> Result<u32, ReplicationError> {
        let result = match self.link_mut() {
            Ok(link) => link.send(query).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Sends `query` and reads its reply within the request timeout. A reply
    /// under any other sync is a protocol violation.
    async fn request(&mut self, query: &Query) -> Result<Frame, ReplicationError> {
        let sync = self.send(query).await?;
        let result = match self.link_mut() {
            Ok(link) => link.read_timeout().await,
            Err(e) => Err(e),
        };
        let frame = result.map_err(|e| self.fail(e))?;
        if frame.header.sync != sync {
            let err = ReplicationError::UnexpectedResponse(format!(
                "expected sync {} in reply to {}, got {}",
                sync,
                query_name(query),
                frame.header.sync
            ));
            self.release(frame);
            return Err(self.fail(err));
        }
        Ok(frame)
    }

    async fn read(&mut self) -> Result<Frame, ReplicationError> {
        self.link_mut()?.read().await
    }

    fn release(&self, frame: Frame) {
        if let Some(link) = &self.link {
            link.reader.release(frame);
        }
    }

    fn publish_vclock(&self) {
        self.vclock_tx.send_replace(self.vclock.clone());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

/// Periodically acknowledges the consumed position so the server keeps an
/// anonymous replica's slot alive. Ticks missed while a write is blocked are
/// skipped, not queued.
async fn heartbeat_loop(
    mut writer: FrameWriter<BoxWriter>,
    mut vclock: watch::Receiver<VectorClock>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut frame = Frame::new();
    loop {
        ticker.tick().await;
        let position = vclock.borrow_and_update().clone();
        frame.reset();
        frame.header = Header::new(code::OK, 0);
        let ack = map_value(vec![(body::VCLOCK, vclock_value(position.as_map()))]);
        if let Err(e) = frame.set_body_value(&ack) {
            tracing::warn!("heartbeat: encode failed: {}", e);
            break;
        }
        if let Err(e) = writer.write_frame(&frame).await {
            tracing::debug!("heartbeat: write failed, stopping: {}", e);
            break;
        }
        tracing::trace!("heartbeat: acknowledged {}", position);
    }
}
