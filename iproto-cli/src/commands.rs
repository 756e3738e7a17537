//! Command execution.

use crate::Commands;
use colored::Colorize;
use iproto_client::client::SelectOptions;
use iproto_client::{Client, ConnectionConfig};
use iproto_protocol::value::to_json;
use iproto_protocol::{Tuple, Value};
use iproto_replication::{Ballot, ReplicaConfig, Session};
use std::time::Instant;

/// Executes a command and returns the formatted output.
pub async fn execute(
    config: ConnectionConfig,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    tracing::debug!("Connecting to {}", config.addr);
    if let Commands::Vote = cmd {
        let mut session = Session::connect(ReplicaConfig::new(config)).await?;
        let ballot = session.vote().await;
        session.close().await;
        return Ok(format_ballot(&ballot?));
    }

    let client = Client::connect(config).await?;
    let output = match cmd {
        Commands::Ping => {
            let started = Instant::now();
            client.ping().await?;
            format!("{} ({:.2?})", "PONG".green(), started.elapsed())
        }

        Commands::Info => {
            let greeting = client.greeting();
            let version = greeting
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let uuid = greeting
                .instance_uuid
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "{}\n  Version: {}\n  Instance: {}",
                greeting.banner.bold(),
                version.cyan(),
                uuid
            )
        }

        Commands::Eval { expr, args } => {
            let rows = client.eval(expr, parse_args(&args)).await?;
            format_json(&rows_json(&rows))
        }

        Commands::Call { function, args } => {
            let rows = client.call(function, parse_args(&args)).await?;
            format_json(&rows_json(&rows))
        }

        Commands::Select {
            space,
            key,
            index,
            limit,
            offset,
            iterator,
        } => {
            let key = match parse_value(&key)? {
                Value::Array(parts) => parts,
                single => vec![single],
            };
            let mut options = SelectOptions::default()
                .with_index(index)
                .with_offset(offset)
                .with_iterator(iterator.into());
            if let Some(limit) = limit {
                options = options.with_limit(limit);
            }
            let rows = client.select(space, key, options).await?;
            format_rows(&rows)
        }

        // Vote runs over a replication session, handled above.
        Commands::Vote => unreachable!(),
    };

    client.close().await;
    Ok(output)
}

/// Parses each argument as JSON, falling back to a plain string.
fn parse_args(args: &[String]) -> Vec<Value> {
    args.iter()
        .map(|arg| {
            serde_json::from_str(arg)
                .map(|json| json_to_value(&json))
                .unwrap_or_else(|_| Value::from(arg.as_str()))
        })
        .collect()
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_value(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let json: serde_json::Value = if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };
    Ok(json_to_value(&json))
}

/// Converts JSON into a msgpack value. Integers stay integers.
fn json_to_value(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        Json::Object(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), json_to_value(v)))
                .collect(),
        ),
    }
}

fn rows_json(rows: &[Tuple]) -> serde_json::Value {
    serde_json::Value::Array(
        rows.iter()
            .map(|row| serde_json::Value::Array(row.iter().map(to_json).collect()))
            .collect(),
    )
}

/// One compact JSON line per tuple.
fn format_rows(rows: &[Tuple]) -> String {
    if rows.is_empty() {
        return "No tuples".yellow().to_string();
    }
    let mut output = String::new();
    for row in rows {
        let json = serde_json::Value::Array(row.iter().map(to_json).collect());
        output.push_str(&json.to_string());
        output.push('\n');
    }
    output.push_str(&format!("{} tuple(s)", rows.len()).dimmed().to_string());
    output
}

fn format_ballot(ballot: &Ballot) -> String {
    let flag = |set: bool| {
        if set {
            "yes".green()
        } else {
            "no".dimmed()
        }
    };
    format!(
        "{}\n  Read-only (cfg): {}\n  Read-only: {}\n  Anonymous: {}\n  Booted: {}\n  Can lead: {}\n  VClock: {}\n  GC VClock: {}",
        "Ballot".bold(),
        flag(ballot.is_ro_cfg),
        flag(ballot.is_ro),
        flag(ballot.is_anon),
        flag(ballot.is_booted),
        flag(ballot.can_lead),
        ballot.vclock,
        ballot.gc_vclock
    )
}

/// Formats JSON for display.
fn format_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_to_value() {
        let json = serde_json::json!([1, -2, 1.5, "x", null, true, {"k": [2]}]);
        let value = json_to_value(&json);
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from(1u64),
                Value::from(-2i64),
                Value::F64(1.5),
                Value::from("x"),
                Value::Nil,
                Value::Boolean(true),
                Value::Map(vec![(
                    Value::from("k"),
                    Value::Array(vec![Value::from(2u64)])
                )]),
            ])
        );
        assert_eq!(to_json(&value), json);
    }

    #[test]
    fn test_parse_args_falls_back_to_string() {
        let args = vec!["42".to_string(), "box.info".to_string(), "\"q\"".to_string()];
        assert_eq!(
            parse_args(&args),
            vec![Value::from(42u64), Value::from("box.info"), Value::from("q")]
        );
    }

    #[test]
    fn test_parse_value_rejects_invalid_json() {
        assert!(parse_value("[1, 2]").is_ok());
        assert!(parse_value("[1,").is_err());
    }

    #[test]
    fn test_format_rows() {
        colored::control::set_override(false);
        let rows = vec![vec![Value::from(1u64), Value::from("one")]];
        assert_eq!(format_rows(&rows), "[1,\"one\"]\n1 tuple(s)");
        assert_eq!(format_rows(&[]), "No tuples");
    }
}
