//! The closed set of commands and their body encodings.
//!
//! Every variant encodes its body with [`Query::encode_body`]. Decoding goes
//! through a table indexed by the header's request code, so the replication
//! stream and test servers can recover the variant from a raw frame.

use crate::error::ProtocolError;
use crate::keys::{body, code};
use crate::value::{self, map_value, uuid_value, Map};
use rmpv::Value;
use std::collections::BTreeMap;
use std::io::Write;
use uuid::Uuid;

/// Authentication mechanism sent with [`Query::Auth`].
pub const AUTH_MECHANISM: &str = "chap-sha1";

/// Instance id to LSN, as carried under [`body::VCLOCK`].
pub type VclockMap = BTreeMap<u32, u64>;

/// Index iterator used by [`Query::Select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IteratorType {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
}

impl IteratorType {
    pub fn as_u32(self) -> u32 {
        match self {
            IteratorType::Eq => 0,
            IteratorType::Req => 1,
            IteratorType::All => 2,
            IteratorType::Lt => 3,
            IteratorType::Le => 4,
            IteratorType::Ge => 5,
            IteratorType::Gt => 6,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => IteratorType::Eq,
            1 => IteratorType::Req,
            2 => IteratorType::All,
            3 => IteratorType::Lt,
            4 => IteratorType::Le,
            5 => IteratorType::Ge,
            6 => IteratorType::Gt,
            _ => return None,
        })
    }
}

/// A protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Ping,
    Auth {
        user: String,
        scramble: Vec<u8>,
    },
    Select {
        space: u32,
        index: u32,
        limit: u32,
        offset: u32,
        iterator: IteratorType,
        key: Vec<Value>,
    },
    Insert {
        space: u32,
        tuple: Vec<Value>,
    },
    Replace {
        space: u32,
        tuple: Vec<Value>,
    },
    Update {
        space: u32,
        index: u32,
        key: Vec<Value>,
        ops: Vec<Value>,
    },
    Delete {
        space: u32,
        index: u32,
        key: Vec<Value>,
    },
    Upsert {
        space: u32,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    },
    Call {
        function: String,
        args: Vec<Value>,
    },
    Eval {
        expr: String,
        args: Vec<Value>,
    },
    /// Log entry that only advances the vector clock.
    Nop,
    Join {
        instance_uuid: Uuid,
    },
    Subscribe {
        instance_uuid: Uuid,
        replicaset_uuid: Uuid,
        vclock: VclockMap,
        anon: bool,
        version_id: Option<u32>,
    },
    FetchSnapshot,
    Register {
        instance_uuid: Uuid,
        vclock: VclockMap,
    },
    Vote,
}

type DecodeFn = fn(&Map) -> Result<Query, ProtocolError>;

/// Request code to body decoder.
const DECODERS: &[(u32, DecodeFn)] = &[
    (code::PING, decode_ping),
    (code::AUTH, decode_auth),
    (code::SELECT, decode_select),
    (code::INSERT, decode_insert),
    (code::REPLACE, decode_replace),
    (code::UPDATE, decode_update),
    (code::DELETE, decode_delete),
    (code::UPSERT, decode_upsert),
    (code::CALL, decode_call),
    (code::EVAL, decode_eval),
    (code::NOP, decode_nop),
    (code::JOIN, decode_join),
    (code::SUBSCRIBE, decode_subscribe),
    (code::FETCH_SNAPSHOT, decode_fetch_snapshot),
    (code::REGISTER, decode_register),
    (code::VOTE, decode_vote),
];

impl Query {
    /// Returns the request code sent in the frame header.
    pub fn code(&self) -> u32 {
        match self {
            Query::Ping => code::PING,
            Query::Auth { .. } => code::AUTH,
            Query::Select { .. } => code::SELECT,
            Query::Insert { .. } => code::INSERT,
            Query::Replace { .. } => code::REPLACE,
            Query::Update { .. } => code::UPDATE,
            Query::Delete { .. } => code::DELETE,
            Query::Upsert { .. } => code::UPSERT,
            Query::Call { .. } => code::CALL,
            Query::Eval { .. } => code::EVAL,
            Query::Nop => code::NOP,
            Query::Join { .. } => code::JOIN,
            Query::Subscribe { .. } => code::SUBSCRIBE,
            Query::FetchSnapshot => code::FETCH_SNAPSHOT,
            Query::Register { .. } => code::REGISTER,
            Query::Vote => code::VOTE,
        }
    }

    /// Returns true for commands that are only valid on a replication session.
    pub fn is_replication(&self) -> bool {
        matches!(
            self,
            Query::Join { .. }
                | Query::Subscribe { .. }
                | Query::FetchSnapshot
                | Query::Register { .. }
                | Query::Vote
        )
    }

    /// Returns the space a data-manipulation command targets.
    pub fn space(&self) -> Option<u32> {
        match self {
            Query::Select { space, .. }
            | Query::Insert { space, .. }
            | Query::Replace { space, .. }
            | Query::Update { space, .. }
            | Query::Delete { space, .. }
            | Query::Upsert { space, .. } => Some(*space),
            _ => None,
        }
    }

    /// Encodes the body into `wr`. Commands without fields write nothing.
    pub fn encode_body<W: Write>(&self, wr: &mut W) -> Result<(), ProtocolError> {
        let entries = match self {
            Query::Ping | Query::Nop | Query::FetchSnapshot | Query::Vote => return Ok(()),
            Query::Auth { user, scramble } => return encode_auth(wr, user, scramble),
            Query::Select {
                space,
                index,
                limit,
                offset,
                iterator,
                key,
            } => vec![
                (body::SPACE_ID, Value::from(*space)),
                (body::INDEX_ID, Value::from(*index)),
                (body::LIMIT, Value::from(*limit)),
                (body::OFFSET, Value::from(*offset)),
                (body::ITERATOR, Value::from(iterator.as_u32())),
                (body::KEY, Value::Array(key.clone())),
            ],
            Query::Insert { space, tuple } | Query::Replace { space, tuple } => vec![
                (body::SPACE_ID, Value::from(*space)),
                (body::TUPLE, Value::Array(tuple.clone())),
            ],
            Query::Update {
                space,
                index,
                key,
                ops,
            } => vec![
                (body::SPACE_ID, Value::from(*space)),
                (body::INDEX_ID, Value::from(*index)),
                (body::KEY, Value::Array(key.clone())),
                (body::TUPLE, Value::Array(ops.clone())),
            ],
            Query::Delete { space, index, key } => vec![
                (body::SPACE_ID, Value::from(*space)),
                (body::INDEX_ID, Value::from(*index)),
                (body::KEY, Value::Array(key.clone())),
            ],
            Query::Upsert { space, tuple, ops } => vec![
                (body::SPACE_ID, Value::from(*space)),
                (body::TUPLE, Value::Array(tuple.clone())),
                (body::OPS, Value::Array(ops.clone())),
            ],
            Query::Call { function, args } => vec![
                (body::FUNCTION_NAME, Value::from(function.as_str())),
                (body::TUPLE, Value::Array(args.clone())),
            ],
            Query::Eval { expr, args } => vec![
                (body::EXPR, Value::from(expr.as_str())),
                (body::TUPLE, Value::Array(args.clone())),
            ],
            Query::Join { instance_uuid } => {
                vec![(body::INSTANCE_UUID, uuid_value(instance_uuid))]
            }
            Query::Subscribe {
                instance_uuid,
                replicaset_uuid,
                vclock,
                anon,
                version_id,
            } => {
                let mut entries = vec![
                    (body::INSTANCE_UUID, uuid_value(instance_uuid)),
                    (body::CLUSTER_UUID, uuid_value(replicaset_uuid)),
                    (body::VCLOCK, vclock_value(vclock)),
                ];
                if let Some(version_id) = version_id {
                    entries.push((body::SERVER_VERSION, Value::from(*version_id)));
                }
                if *anon {
                    entries.push((body::REPLICA_ANON, Value::from(true)));
                }
                entries
            }
            Query::Register {
                instance_uuid,
                vclock,
            } => vec![
                (body::INSTANCE_UUID, uuid_value(instance_uuid)),
                (body::VCLOCK, vclock_value(vclock)),
            ],
        };
        value::encode_value(wr, &map_value(entries))
    }

    /// Decodes a body for request code `code`.
    pub fn decode(code: u32, body: &[u8]) -> Result<Query, ProtocolError> {
        let decoder = DECODERS
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, f)| *f)
            .ok_or(ProtocolError::UnknownCommand(code))?;
        let map = value::decode_map(body)?;
        decoder(&map)
    }
}

/// Encodes a vector clock as an id to LSN map.
pub fn vclock_value(vclock: &VclockMap) -> Value {
    Value::Map(
        vclock
            .iter()
            .map(|(id, lsn)| (Value::from(*id), Value::from(*lsn)))
            .collect(),
    )
}

/// Decodes a vector clock map, naming `key` on a shape mismatch.
pub fn decode_vclock(value: &Value, key: u64) -> Result<VclockMap, ProtocolError> {
    let map = value.as_map().ok_or(ProtocolError::ExpectedMap(key))?;
    map.iter()
        .map(|(id, lsn)| {
            let id = id
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or(ProtocolError::ExpectedNumber(key))?;
            let lsn = lsn.as_u64().ok_or(ProtocolError::ExpectedNumber(key))?;
            Ok((id, lsn))
        })
        .collect()
}

fn encode_auth<W: Write>(wr: &mut W, user: &str, scramble: &[u8]) -> Result<(), ProtocolError> {
    // The scramble goes out as a msgpack str of raw bytes, which rmpv cannot
    // build from non-UTF-8 data, so the body is written by hand.
    wr.write_all(&[0x82, body::USER_NAME as u8])?;
    value::encode_value(wr, &Value::from(user))?;
    wr.write_all(&[body::TUPLE as u8, 0x92])?;
    value::encode_value(wr, &Value::from(AUTH_MECHANISM))?;
    match scramble.len() {
        len @ 0..=31 => wr.write_all(&[0xa0 | len as u8])?,
        len @ 32..=255 => wr.write_all(&[0xd9, len as u8])?,
        _ => return Err(ProtocolError::MalformedBody("scramble too long")),
    }
    wr.write_all(scramble)?;
    Ok(())
}

fn opt_vclock(map: &Map, key: u64) -> Result<VclockMap, ProtocolError> {
    match value::get(map, key) {
        Some(v) => decode_vclock(v, key),
        None => Ok(VclockMap::new()),
    }
}

fn owned_array(map: &Map, key: u64) -> Result<Vec<Value>, ProtocolError> {
    Ok(value::array_or_empty(map, key)?.to_vec())
}

fn decode_ping(_: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Ping)
}

fn decode_nop(_: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Nop)
}

fn decode_fetch_snapshot(_: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::FetchSnapshot)
}

fn decode_vote(_: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Vote)
}

fn decode_auth(map: &Map) -> Result<Query, ProtocolError> {
    let user = value::get_str(map, body::USER_NAME)?.to_string();
    let tuple = value::get_array(map, body::TUPLE)?;
    let scramble = match tuple.get(1) {
        Some(Value::String(s)) => s.as_bytes().to_vec(),
        Some(Value::Binary(b)) => b.clone(),
        _ => return Err(ProtocolError::ExpectedString(body::TUPLE)),
    };
    Ok(Query::Auth { user, scramble })
}

fn decode_select(map: &Map) -> Result<Query, ProtocolError> {
    let raw_iterator = value::opt_u32(map, body::ITERATOR)?.unwrap_or(0);
    Ok(Query::Select {
        space: value::get_u32(map, body::SPACE_ID)?,
        index: value::opt_u32(map, body::INDEX_ID)?.unwrap_or(0),
        limit: value::opt_u32(map, body::LIMIT)?.unwrap_or(u32::MAX),
        offset: value::opt_u32(map, body::OFFSET)?.unwrap_or(0),
        iterator: IteratorType::from_u32(raw_iterator)
            .ok_or(ProtocolError::ExpectedNumber(body::ITERATOR))?,
        key: owned_array(map, body::KEY)?,
    })
}

fn decode_insert(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Insert {
        space: value::get_u32(map, body::SPACE_ID)?,
        tuple: value::get_array(map, body::TUPLE)?.to_vec(),
    })
}

fn decode_replace(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Replace {
        space: value::get_u32(map, body::SPACE_ID)?,
        tuple: value::get_array(map, body::TUPLE)?.to_vec(),
    })
}

fn decode_update(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Update {
        space: value::get_u32(map, body::SPACE_ID)?,
        index: value::opt_u32(map, body::INDEX_ID)?.unwrap_or(0),
        key: owned_array(map, body::KEY)?,
        ops: owned_array(map, body::TUPLE)?,
    })
}

fn decode_delete(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Delete {
        space: value::get_u32(map, body::SPACE_ID)?,
        index: value::opt_u32(map, body::INDEX_ID)?.unwrap_or(0),
        key: owned_array(map, body::KEY)?,
    })
}

fn decode_upsert(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Upsert {
        space: value::get_u32(map, body::SPACE_ID)?,
        tuple: value::get_array(map, body::TUPLE)?.to_vec(),
        ops: owned_array(map, body::OPS)?,
    })
}

fn decode_call(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Call {
        function: value::get_str(map, body::FUNCTION_NAME)?.to_string(),
        args: owned_array(map, body::TUPLE)?,
    })
}

fn decode_eval(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Eval {
        expr: value::get_str(map, body::EXPR)?.to_string(),
        args: owned_array(map, body::TUPLE)?,
    })
}

fn decode_join(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Join {
        instance_uuid: value::get_uuid(map, body::INSTANCE_UUID)?,
    })
}

fn decode_subscribe(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Subscribe {
        instance_uuid: value::get_uuid(map, body::INSTANCE_UUID)?,
        replicaset_uuid: value::opt_uuid(map, body::CLUSTER_UUID)?.unwrap_or_default(),
        vclock: opt_vclock(map, body::VCLOCK)?,
        anon: value::opt_bool(map, body::REPLICA_ANON)?.unwrap_or(false),
        version_id: value::opt_u32(map, body::SERVER_VERSION)?,
    })
}

fn decode_register(map: &Map) -> Result<Query, ProtocolError> {
    Ok(Query::Register {
        instance_uuid: value::get_uuid(map, body::INSTANCE_UUID)?,
        vclock: opt_vclock(map, body::VCLOCK)?,
    })
}
