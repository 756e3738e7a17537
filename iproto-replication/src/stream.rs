//! Background delivery of replication entries.

use crate::entry::Entry;
use crate::error::ReplicationError;
use crate::session::{Phase, Session};
use crate::vclock::VectorClock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default depth of the entry queue.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// Entries pushed by a background task that owns the session.
///
/// The task stops when the session yields end of stream or an error, or
/// when the stream is dropped. The queue is bounded: a slow consumer stalls
/// the task, which stops reading from the server.
pub struct EntryStream {
    entries: mpsc::Receiver<Result<Entry, ReplicationError>>,
    vclock: watch::Receiver<VectorClock>,
    failure: Option<String>,
    task: JoinHandle<()>,
}

impl Session {
    /// Moves the session into a background task that pushes entries into a
    /// queue of `capacity`. Consuming the session rules out pulling from it
    /// directly at the same time.
    pub fn into_stream(self, capacity: usize) -> EntryStream {
        let (tx, entries) = mpsc::channel(capacity.max(1));
        let vclock = self.watch_vclock();
        let task = tokio::spawn(pump(self, tx));
        EntryStream {
            entries,
            vclock,
            failure: None,
            task,
        }
    }
}

async fn pump(mut session: Session, tx: mpsc::Sender<Result<Entry, ReplicationError>>) {
    loop {
        match session.next().await {
            Ok(Some(entry)) => {
                if tx.send(Ok(entry)).await.is_err() {
                    tracing::debug!("Entry stream dropped, stopping");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    if session.phase() != Phase::Failed {
        session.close().await;
    }
}

impl EntryStream {
    /// Returns the next entry, `None` at end of stream.
    ///
    /// After an error, every later call returns [`ReplicationError::Failed`].
    pub async fn next(&mut self) -> Result<Option<Entry>, ReplicationError> {
        if let Some(reason) = &self.failure {
            return Err(ReplicationError::Failed {
                reason: reason.clone(),
            });
        }
        match self.entries.recv().await {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => {
                self.failure = Some(e.to_string());
                Err(e)
            }
            None => Ok(None),
        }
    }

    /// Snapshot of the position consumed by the session.
    pub fn vclock(&self) -> VectorClock {
        self.vclock.borrow().clone()
    }

    /// Receiver notified whenever the position advances.
    pub fn watch_vclock(&self) -> watch::Receiver<VectorClock> {
        self.vclock.clone()
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use iproto_protocol::keys::code;
    use iproto_protocol::Value;

    #[tokio::test]
    async fn test_stream_delivers_until_error() {
        let (session, mut server) = testing::session(testing::BANNER, testing::config()).await;
        let subscribe = testing::spawn_subscribe(session);
        server.expect(code::SUBSCRIBE).await;
        server.ok(vec![]).await;
        let session = subscribe.await.unwrap().unwrap();

        let mut stream = session.into_stream(2);
        for lsn in 1..=5u64 {
            server.entry(1, lsn, 512, vec![Value::from(lsn)]).await;
        }
        server.entry(1, 5, 512, vec![Value::from(5u64)]).await;

        for lsn in 1..=5u64 {
            let entry = stream.next().await.unwrap().unwrap();
            assert_eq!(entry.lsn, lsn);
        }
        assert_eq!(stream.vclock().get(1), 5);

        assert!(matches!(
            stream.next().await,
            Err(ReplicationError::OrderingViolation { .. })
        ));
        assert!(matches!(
            stream.next().await,
            Err(ReplicationError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_when_server_closes() {
        let (session, mut server) = testing::session(testing::BANNER, testing::config()).await;
        let subscribe = testing::spawn_subscribe(session);
        server.expect(code::SUBSCRIBE).await;
        server.ok(vec![]).await;
        let session = subscribe.await.unwrap().unwrap();
        let mut watch = session.watch_vclock();

        let mut stream = session.into_stream(DEFAULT_STREAM_CAPACITY);
        server.entry(3, 1, 512, vec![]).await;
        drop(server);

        assert_eq!(stream.next().await.unwrap().unwrap().replica_id, 3);
        assert!(stream.next().await.unwrap().is_none());
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(watch.borrow_and_update().get(3), 1);
    }
}
