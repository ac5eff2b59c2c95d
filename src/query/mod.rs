//! Query dispatch pipeline
//!
//! [`QueryProcessor`] is the per-daemon builder: it holds a weak reference
//! to the engine connection and manufactures one [`QueryResultsPooler`]
//! per incoming HTTP query. The weak back-reference breaks the ownership
//! cycle processor → connection → sessions → processor; every operation
//! upgrades it and fails with `ConnectionClosed` once the engine is gone.

pub mod formatter;
pub mod pooler;

use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::storage::{Connection, RequestError, StorageError};
use crate::types::ApiEndpoint;

pub use formatter::OutputFormatter;
pub use pooler::{QueryResultsPooler, DEFAULT_RDBUF_SIZE};

/// Error surface of the query pipeline.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query not started")]
    NotStarted,
    #[error("query already started")]
    AlreadyStarted,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid query: {0}")]
    Parse(String),
    #[error("formatted sample does not fit the read buffer")]
    Formatter,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RequestError> for QueryError {
    fn from(err: RequestError) -> Self {
        QueryError::Parse(err.to_string())
    }
}

/// Builder for streaming read operations.
pub struct QueryProcessor {
    con: Weak<Connection>,
    rdbuf_size: usize,
}

impl QueryProcessor {
    pub fn new(con: &Arc<Connection>, rdbuf_size: usize) -> Self {
        Self {
            con: Arc::downgrade(con),
            rdbuf_size,
        }
    }

    fn upgrade(&self) -> Result<Arc<Connection>, QueryError> {
        self.con.upgrade().ok_or(QueryError::ConnectionClosed)
    }

    /// Create a new pooler bound to a freshly created session.
    pub fn create(&self, endpoint: ApiEndpoint) -> Result<QueryResultsPooler, QueryError> {
        let con = self.upgrade()?;
        Ok(QueryResultsPooler::new(
            con.create_session(),
            self.rdbuf_size,
            endpoint,
        ))
    }

    /// Textual statistics blob fetched from the engine.
    pub fn get_all_stats(&self) -> Result<String, QueryError> {
        Ok(self.upgrade()?.stats())
    }

    /// Engine-exposed textual resource (series list, function catalog, ...).
    pub fn get_resource(&self, name: &str) -> Result<String, QueryError> {
        Ok(self.upgrade()?.resource(name)?)
    }
}
