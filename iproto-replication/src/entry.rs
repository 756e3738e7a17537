//! Log entries delivered to the consumer.

use iproto_protocol::Query;

/// Phase an entry was received in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Row of the initial state transfer.
    Join,
    /// Row of the change stream.
    Stream,
}

/// A replicated row.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub origin: Origin,
    /// Originating instance; 0 for snapshot rows that carry none.
    pub replica_id: u32,
    /// Position in the originating instance's log; 0 when not carried.
    pub lsn: u64,
    pub timestamp: Option<f64>,
    /// The row as a command (`Insert`, `Replace`, `Update`, `Delete`,
    /// `Upsert` or `Nop`).
    pub query: Query,
}

impl Entry {
    /// Space the row modifies, if any.
    pub fn space(&self) -> Option<u32> {
        self.query.space()
    }
}
