//! Request codes and map keys used on the wire.
//!
//! These values are part of the data store's protocol contract and must match
//! the server exactly.

/// Request and response type codes carried under [`header::REQUEST_TYPE`].
pub mod code {
    pub const OK: u32 = 0x00;
    pub const SELECT: u32 = 0x01;
    pub const INSERT: u32 = 0x02;
    pub const REPLACE: u32 = 0x03;
    pub const UPDATE: u32 = 0x04;
    pub const DELETE: u32 = 0x05;
    pub const AUTH: u32 = 0x07;
    pub const EVAL: u32 = 0x08;
    pub const UPSERT: u32 = 0x09;
    pub const CALL: u32 = 0x0a;
    pub const NOP: u32 = 0x0c;
    pub const PING: u32 = 0x40;
    pub const JOIN: u32 = 0x41;
    pub const SUBSCRIBE: u32 = 0x42;
    pub const VOTE: u32 = 0x44;
    pub const FETCH_SNAPSHOT: u32 = 0x45;
    pub const REGISTER: u32 = 0x46;

    /// High bit marking an error response; the low bits hold the error code.
    pub const ERROR_FLAG: u32 = 0x8000;

    /// Mask extracting the error code from an error response type.
    pub const ERROR_CODE_MASK: u32 = 0x7fff;

    /// Returns true if `code` marks an error response.
    pub fn is_error(code: u32) -> bool {
        code & ERROR_FLAG != 0
    }
}

/// Keys of the frame header map.
pub mod header {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const REPLICA_ID: u64 = 0x02;
    pub const LSN: u64 = 0x03;
    pub const TIMESTAMP: u64 = 0x04;
    pub const SCHEMA_VERSION: u64 = 0x05;
}

/// Keys of the frame body map.
pub mod body {
    pub const SERVER_VERSION: u64 = 0x06;
    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const INSTANCE_UUID: u64 = 0x24;
    pub const CLUSTER_UUID: u64 = 0x25;
    pub const VCLOCK: u64 = 0x26;
    pub const EXPR: u64 = 0x27;
    pub const OPS: u64 = 0x28;
    pub const BALLOT: u64 = 0x29;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
    pub const REPLICA_ANON: u64 = 0x50;
}

/// Keys of the map carried under [`body::BALLOT`] in a vote response.
pub mod ballot {
    pub const IS_RO_CFG: u64 = 0x01;
    pub const VCLOCK: u64 = 0x02;
    pub const GC_VCLOCK: u64 = 0x03;
    pub const IS_RO: u64 = 0x04;
    pub const IS_ANON: u64 = 0x05;
    pub const IS_BOOTED: u64 = 0x06;
    pub const CAN_LEAD: u64 = 0x07;
}

/// Well-known system space ids.
pub mod space {
    /// `_schema`: holds the `["cluster", <uuid>]` row naming the replica set.
    pub const SCHEMA: u32 = 272;
    /// `_cluster`: one `[<instance id>, <uuid>]` row per registered instance.
    pub const CLUSTER: u32 = 320;
}

/// Server error codes the client reacts to.
pub mod errcode {
    /// Duplicate key; also what a master answers to a JOIN from a known instance.
    pub const TUPLE_FOUND: u32 = 3;
    pub const READONLY: u32 = 7;
    pub const ACCESS_DENIED: u32 = 42;
    pub const NO_SUCH_USER: u32 = 45;
    pub const CREDS_MISMATCH: u32 = 47;
    pub const LOADING: u32 = 116;
}
