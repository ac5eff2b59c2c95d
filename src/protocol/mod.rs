//! Wire-protocol parsers for ingestion
//!
//! Each parser consumes a byte stream from a transport and writes samples
//! through a borrowed [`Session`](crate::storage::Session). Parsers are
//! cheap to construct: the UDP ingestor builds a fresh one per datagram
//! batch so a malformed packet can never corrupt parser state across
//! batches.

pub mod opentsdb;
pub mod resp;

use thiserror::Error;

use crate::storage::StorageError;

pub use opentsdb::TelnetParser;
pub use resp::RespParser;

/// Malformed input on the wire.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unexpected control byte {byte:#04x} while reading {context}")]
    UnexpectedByte { byte: u8, context: &'static str },
    #[error("bad timestamp: `{0}`")]
    BadTimestamp(String),
    #[error("bad value: `{0}`")]
    BadValue(String),
    #[error("bad array header: `{0}`")]
    BadArray(String),
    #[error("bad command: `{0}`")]
    BadCommand(String),
    #[error("input is not valid UTF-8")]
    Utf8,
}

/// Failure while feeding bytes into a parser: either the frame itself is
/// malformed, or the engine rejected a decoded sample.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Database(#[from] StorageError),
}
