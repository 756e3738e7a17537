//! JSON line rendering of replicated entries.

use iproto_protocol::value::to_json;
use iproto_protocol::{Query, Value};
use iproto_replication::{Entry, Origin};
use serde_json::{json, Map};

fn values(items: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(items.iter().map(to_json).collect())
}

/// Renders an entry as a flat JSON object.
pub fn entry_json(entry: &Entry) -> serde_json::Value {
    let mut out = Map::new();
    let origin = match entry.origin {
        Origin::Join => "join",
        Origin::Stream => "stream",
    };
    out.insert("origin".into(), json!(origin));
    out.insert("replica_id".into(), json!(entry.replica_id));
    out.insert("lsn".into(), json!(entry.lsn));
    if let Some(ts) = entry.timestamp {
        out.insert("timestamp".into(), json!(ts));
    }

    match &entry.query {
        Query::Insert { space, tuple } => {
            out.insert("request".into(), json!("insert"));
            out.insert("space".into(), json!(space));
            out.insert("tuple".into(), values(tuple));
        }
        Query::Replace { space, tuple } => {
            out.insert("request".into(), json!("replace"));
            out.insert("space".into(), json!(space));
            out.insert("tuple".into(), values(tuple));
        }
        Query::Update {
            space,
            index,
            key,
            ops,
        } => {
            out.insert("request".into(), json!("update"));
            out.insert("space".into(), json!(space));
            out.insert("index".into(), json!(index));
            out.insert("key".into(), values(key));
            out.insert("ops".into(), values(ops));
        }
        Query::Delete { space, index, key } => {
            out.insert("request".into(), json!("delete"));
            out.insert("space".into(), json!(space));
            out.insert("index".into(), json!(index));
            out.insert("key".into(), values(key));
        }
        Query::Upsert { space, tuple, ops } => {
            out.insert("request".into(), json!("upsert"));
            out.insert("space".into(), json!(space));
            out.insert("tuple".into(), values(tuple));
            out.insert("ops".into(), values(ops));
        }
        Query::Nop => {
            out.insert("request".into(), json!("nop"));
        }
        other => {
            out.insert("request".into(), json!(other.code()));
        }
    }
    serde_json::Value::Object(out)
}
