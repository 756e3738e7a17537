//! Replica configuration.

use crate::vclock::VectorClock;
use iproto_client::ConnectionConfig;
use iproto_protocol::keys::errcode;
use iproto_protocol::Version;
use std::time::Duration;
use uuid::Uuid;

/// Default interval between anonymous replica heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default server error code meaning "already a member of the replica set".
pub const DEFAULT_ALREADY_MEMBER_CODE: u32 = errcode::TUPLE_FOUND;

/// Oldest server version that accepts anonymous replicas.
pub const MIN_ANONYMOUS_VERSION: Version = Version::new(2, 3, 1);

/// Replication session configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub connection: ConnectionConfig,
    /// Local instance UUID, generated when not supplied.
    pub instance_uuid: Uuid,
    /// Replica set UUID, learned from the server when not supplied.
    pub replicaset_uuid: Option<Uuid>,
    /// Follow without registering in the replica set.
    pub anonymous: bool,
    /// Position to subscribe from when join is skipped.
    pub vclock: VectorClock,
    pub heartbeat_interval: Duration,
    /// Server error code (low 15 bits) treated as "already joined".
    pub already_member_code: u32,
}

impl ReplicaConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            instance_uuid: Uuid::new_v4(),
            replicaset_uuid: None,
            anonymous: false,
            vclock: VectorClock::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            already_member_code: DEFAULT_ALREADY_MEMBER_CODE,
        }
    }

    pub fn with_instance_uuid(mut self, uuid: Uuid) -> Self {
        self.instance_uuid = uuid;
        self
    }

    /// Sets the expected replica set UUID. The nil UUID means unknown.
    pub fn with_replicaset_uuid(mut self, uuid: Uuid) -> Self {
        self.replicaset_uuid = (!uuid.is_nil()).then_some(uuid);
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_vclock(mut self, vclock: VectorClock) -> Self {
        self.vclock = vclock;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.heartbeat_interval = interval;
        }
        self
    }

    pub fn with_already_member_code(mut self, code: u32) -> Self {
        self.already_member_code = code;
        self
    }
}
