//! # iproto-protocol
//!
//! Wire protocol implementation for iproto, the msgpack-based binary protocol
//! spoken by the data store.
//!
//! This crate provides:
//! - Length-prefixed framing with a reusable frame pool
//! - Async frame reader/writer over any byte stream
//! - The closed [`Query`] command set with a code-indexed decode table
//! - Response decoding (data tuples or server errors)
//! - Greeting parsing and `chap-sha1` challenge response
//! - Request codes and map keys used on the wire

pub mod codec;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod keys;
pub mod pool;
pub mod query;
pub mod response;
pub mod value;

pub use codec::{FrameReader, FrameWriter};
pub use error::{ProtocolError, ServerError};
pub use frame::{Frame, Header};
pub use greeting::{scramble, Greeting, Version};
pub use pool::{FramePool, PoolStats};
pub use query::{IteratorType, Query};
pub use response::{Payload, Response, Tuple};

/// Re-exported so callers can build tuples without naming `rmpv` themselves.
pub use rmpv::Value;

/// Size of the server greeting sent on every new connection.
pub const GREETING_SIZE: usize = 128;

/// Default port for the data store.
pub const DEFAULT_PORT: u16 = 3301;

/// Maximum accepted frame size (header + body), 256 MiB.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;
