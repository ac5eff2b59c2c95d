//! Core types shared across the daemon

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Series identifier, assigned by the storage engine on first sight.
pub type ParamId = u64;

/// Monotonic timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = u64;

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Number of usable CPU cores, cached after the first call.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Tagged sample payload. The tag doubles as the payload-shape flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    /// Scalar measurement
    Float(f64),
    /// Multi-column measurement
    Tuple(Vec<f64>),
    /// Opaque payload (used by suggest/search cursors to carry series names)
    Blob(Vec<u8>),
}

/// The atomic unit crossing every boundary of the daemon.
///
/// Samples are value types: they are cloned freely and never shared by
/// reference across threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub paramid: ParamId,
    pub timestamp: Timestamp,
    pub value: SampleValue,
}

impl Sample {
    /// Create a scalar sample.
    pub fn float(paramid: ParamId, timestamp: Timestamp, value: f64) -> Self {
        Self {
            paramid,
            timestamp,
            value: SampleValue::Float(value),
        }
    }

    /// Create a multi-column sample.
    pub fn tuple(paramid: ParamId, timestamp: Timestamp, values: Vec<f64>) -> Self {
        Self {
            paramid,
            timestamp,
            value: SampleValue::Tuple(values),
        }
    }

    /// Create an opaque-payload sample.
    pub fn blob(paramid: ParamId, payload: Vec<u8>) -> Self {
        Self {
            paramid,
            timestamp: 0,
            value: SampleValue::Blob(payload),
        }
    }
}

/// Tag selecting among the HTTP request shapes served by the query pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiEndpoint {
    Query,
    Suggest,
    Search,
}

impl fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiEndpoint::Query => write!(f, "query"),
            ApiEndpoint::Suggest => write!(f, "suggest"),
            ApiEndpoint::Search => write!(f, "search"),
        }
    }
}

/// One (protocol-name, endpoint) pair inside a server's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEndpoint {
    pub name: String,
    pub addr: SocketAddr,
}

impl ProtocolEndpoint {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

/// Settings bundle describing one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Human name; also the registry lookup key ("HTTP", "TCP", "UDP")
    pub name: String,
    /// Ordered list of protocol endpoints this server listens on
    pub protocols: Vec<ProtocolEndpoint>,
    /// Worker-pool size; -1 or 0 means auto-detect from hardware concurrency
    pub nworkers: i32,
}

impl ServerSettings {
    /// Resolve the worker-pool size, auto-detecting when unset.
    pub fn pool_size(&self) -> usize {
        if self.nworkers <= 0 {
            available_cpus()
        } else {
            self.nworkers as usize
        }
    }
}

/// Write-ahead-log settings handed to the storage engine.
///
/// An empty path or zero volume count/size means the WAL is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSettings {
    pub path: PathBuf,
    pub nvolumes: i32,
    pub volume_size: u64,
}

impl WalSettings {
    pub fn is_enabled(&self) -> bool {
        !self.path.as_os_str().is_empty() && self.nvolumes != 0 && self.volume_size != 0
    }
}

/// Parse a timestamp: either a raw nanosecond count or basic ISO 8601
/// (`YYYYMMDDThhmmss` with an optional fractional part).
pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    if let Ok(nanos) = text.parse::<u64>() {
        return Some(nanos);
    }
    let dt = chrono::NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%S%.f").ok()?;
    let nanos = dt.and_utc().timestamp_nanos_opt()?;
    u64::try_from(nanos).ok()
}

/// Render a nanosecond timestamp as basic ISO 8601 with nanosecond precision.
pub fn format_timestamp(ts: Timestamp) -> String {
    let Ok(signed) = i64::try_from(ts) else {
        return ts.to_string();
    };
    chrono::DateTime::from_timestamp_nanos(signed)
        .format("%Y%m%dT%H%M%S%.9f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timestamp_accepts_raw_nanos() {
        assert_eq!(parse_timestamp("1577836800000000000"), Some(1_577_836_800_000_000_000));
    }

    #[test]
    fn parse_timestamp_accepts_basic_iso() {
        // 2020-01-01T00:00:00 UTC
        assert_eq!(parse_timestamp("20200101T000000"), Some(1_577_836_800_000_000_000));
        assert_eq!(
            parse_timestamp("20200101T000000.5"),
            Some(1_577_836_800_500_000_000)
        );
        assert_eq!(parse_timestamp("not-a-time"), None);
    }

    #[test]
    fn format_timestamp_roundtrips_through_parse() {
        let ts = 1_577_836_800_123_456_789;
        let text = format_timestamp(ts);
        assert_eq!(text, "20200101T000000.123456789");
        assert_eq!(parse_timestamp(&text), Some(ts));
    }

    #[test]
    fn pool_size_auto_detects_for_nonpositive_nworkers() {
        let settings = ServerSettings {
            name: "TCP".to_string(),
            protocols: Vec::new(),
            nworkers: -1,
        };
        assert!(settings.pool_size() >= 1);

        let settings = ServerSettings {
            nworkers: 0,
            ..settings
        };
        assert!(settings.pool_size() >= 1);
    }

    #[test]
    fn pool_size_uses_explicit_value() {
        let settings = ServerSettings {
            name: "UDP".to_string(),
            protocols: Vec::new(),
            nworkers: 3,
        };
        assert_eq!(settings.pool_size(), 3);
    }

    #[test]
    fn wal_disabled_when_any_field_is_empty() {
        assert!(!WalSettings::default().is_enabled());
        assert!(!WalSettings {
            path: PathBuf::from("/tmp"),
            nvolumes: 0,
            volume_size: 1 << 20,
        }
        .is_enabled());
        assert!(WalSettings {
            path: PathBuf::from("/tmp"),
            nvolumes: 4,
            volume_size: 1 << 20,
        }
        .is_enabled());
    }
}
