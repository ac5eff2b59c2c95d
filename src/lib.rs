//! akumulid: time-series database daemon
//!
//! The edge tier of an embedded time-series database, featuring:
//! - Multi-protocol ingestion: RESP over TCP and UDP, OpenTSDB telnet over TCP
//! - A UDP batch ingestor with a dedicated worker-thread pool
//! - An HTTP query API with streaming, backpressured result delivery
//! - A pluggable server registry driven by a single configuration file

pub mod config;
pub mod protocol;
pub mod query;
pub mod server;
pub mod signal;
pub mod storage;
pub mod types;

pub use config::ConfigFile;
pub use types::{ApiEndpoint, ProtocolEndpoint, Sample, SampleValue, ServerSettings, WalSettings};
