//! # iproto-replication
//!
//! Replication follower for iproto servers.
//!
//! A [`Session`] performs the initial state transfer (join), then consumes
//! the ordered change stream (subscribe), either as a registered member of
//! the replica set or as an anonymous observer.
//!
//! ```text
//! Disconnected -> Connected -> Joining -> Joined -> Subscribing -> Streaming -> Closed
//!                     |                                 ^
//!                     +---------------------------------+  (resume without join)
//!
//! any non-terminal phase -> Failed
//! ```

pub mod ballot;
pub mod config;
pub mod directory;
pub mod entry;
pub mod error;
pub mod session;
pub mod stream;
pub mod vclock;

#[cfg(test)]
mod testing;

pub use ballot::Ballot;
pub use config::ReplicaConfig;
pub use directory::Directory;
pub use entry::{Entry, Origin};
pub use error::ReplicationError;
pub use session::{Phase, Session};
pub use stream::EntryStream;
pub use vclock::VectorClock;
