//! iproto - replication tail.
//!
//! Attaches to an iproto data store as a (possibly anonymous) replica and
//! prints every replicated entry to stdout as a JSON line.

mod config;
mod output;

use config::Config;
use iproto_replication::Session;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the entries
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("IPROTO_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let replica = config.replica_config();
    tracing::info!("Starting iproto replication tail");
    tracing::info!("  Upstream: {}", replica.connection.addr);
    tracing::info!("  Instance UUID: {}", replica.instance_uuid);
    tracing::info!(
        "  Mode: {}",
        if replica.anonymous { "anonymous" } else { "registered" }
    );

    let mut session = Session::connect(replica).await?;
    if let Some(greeting) = session.greeting() {
        tracing::info!("  Server: {}", greeting.banner);
    }

    let stdout = std::io::stdout();
    if config.replication.skip_join {
        tracing::info!("Skipping join, subscribing from {}", session.vclock());
        session.subscribe().await?;
    } else if config.replication.print_snapshot {
        session.join().await?;
        let mut rows = 0u64;
        while let Some(entry) = session.next().await? {
            writeln!(stdout.lock(), "{}", output::entry_json(&entry))?;
            rows += 1;
        }
        tracing::info!("Join complete: {} rows, vclock {}", rows, session.vclock());
        session.subscribe().await?;
    } else {
        session.attach().await?;
    }

    if let Some(id) = session.instance_id() {
        tracing::info!("  Instance id: {}", id);
    }
    if let Some(uuid) = session.directory().replicaset_uuid() {
        tracing::info!("  Replica set: {}", uuid);
    }
    tracing::info!("Streaming from {}", session.vclock());

    let mut stream = session.into_stream(config.replication.queue_capacity);
    loop {
        tokio::select! {
            entry = stream.next() => match entry {
                Ok(Some(entry)) => {
                    writeln!(stdout.lock(), "{}", output::entry_json(&entry))?;
                }
                Ok(None) => {
                    tracing::info!("Upstream closed the stream");
                    break;
                }
                Err(e) => {
                    tracing::error!("Replication failed: {}", e);
                    return Err(e.into());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping...");
                break;
            }
        }
    }

    tracing::info!("Stopped at {}", stream.vclock());
    Ok(())
}
