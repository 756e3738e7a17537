//! High-level client API.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::mux::Multiplexer;
use iproto_protocol::{Greeting, IteratorType, Query, Tuple, Value};
use std::sync::Arc;

/// Options for [`Client::select`].
#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub index: u32,
    pub limit: u32,
    pub offset: u32,
    pub iterator: IteratorType,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            index: 0,
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::Eq,
        }
    }
}

impl SelectOptions {
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }
}

/// High-level client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    mux: Arc<Multiplexer>,
}

impl Client {
    /// Connects to the server and starts multiplexing.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let mux = Multiplexer::connect(config).await?;
        Ok(Self::from_multiplexer(mux))
    }

    pub fn from_multiplexer(mux: Multiplexer) -> Self {
        Self { mux: Arc::new(mux) }
    }

    /// Returns whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.mux.is_closed()
    }

    /// Closes the connection, failing requests still in flight.
    pub async fn close(&self) {
        self.mux.close().await
    }

    /// Returns the underlying multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn greeting(&self) -> &Greeting {
        self.mux.greeting()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.mux.pending_count()
    }

    async fn request(&self, query: Query) -> Result<Vec<Tuple>, ClientError> {
        let response = self.mux.request(&query).await?;
        Ok(response.into_result()?)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Query::Ping).await?;
        Ok(())
    }

    /// Calls a stored function.
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Call {
            function: function.into(),
            args,
        })
        .await
    }

    /// Evaluates an expression on the server.
    pub async fn eval(
        &self,
        expr: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Eval {
            expr: expr.into(),
            args,
        })
        .await
    }

    // =========================================================================
    // Data operations
    // =========================================================================

    pub async fn select(
        &self,
        space: u32,
        key: Vec<Value>,
        options: SelectOptions,
    ) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Select {
            space,
            index: options.index,
            limit: options.limit,
            offset: options.offset,
            iterator: options.iterator,
            key,
        })
        .await
    }

    /// Inserts a tuple. Fails if the primary key already exists.
    pub async fn insert(&self, space: u32, tuple: Tuple) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Insert { space, tuple }).await
    }

    /// Inserts or replaces a tuple.
    pub async fn replace(&self, space: u32, tuple: Tuple) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Replace { space, tuple }).await
    }

    /// Applies update operations (e.g. `["=", 1, "x"]`) to the tuple matching `key`.
    pub async fn update(
        &self,
        space: u32,
        index: u32,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Update {
            space,
            index,
            key,
            ops,
        })
        .await
    }

    pub async fn delete(
        &self,
        space: u32,
        index: u32,
        key: Vec<Value>,
    ) -> Result<Vec<Tuple>, ClientError> {
        self.request(Query::Delete { space, index, key }).await
    }

    /// Inserts `tuple`, or applies `ops` if it already exists. Returns nothing.
    pub async fn upsert(&self, space: u32, tuple: Tuple, ops: Vec<Value>) -> Result<(), ClientError> {
        self.request(Query::Upsert { space, tuple, ops }).await?;
        Ok(())
    }
}
