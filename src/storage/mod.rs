//! Embedded storage engine façade
//!
//! `Connection` is the process-global engine handle, `Session` the
//! single-writer handle used by one ingestion worker or one query, and
//! `Cursor` a finite single-reader sample stream. The daemon only ever
//! touches the engine through these three types.

pub mod registry;
pub mod request;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::types::{ParamId, Sample, SampleValue, Timestamp, WalSettings};

pub use registry::SeriesRegistry;
pub use request::{QueryOutput, QueryRequest, RequestError};

/// Name of the database manifest file inside the data path.
pub const MANIFEST_FILE: &str = "db.akumuli";

/// Volume size used by `--CI` test databases.
pub const TEST_DB_VOLUME_SIZE: u64 = 2 * 1024 * 1024;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Engine error surface visible to the daemon.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("late write detected: series {paramid}, timestamp {timestamp} < {last}")]
    LateWrite {
        paramid: ParamId,
        timestamp: Timestamp,
        last: Timestamp,
    },
    #[error("duplicate timestamp: series {paramid}, timestamp {timestamp}")]
    DuplicateTimestamp {
        paramid: ParamId,
        timestamp: Timestamp,
    },
    #[error("unknown series id {0}")]
    UnknownSeries(ParamId),
    #[error("invalid series name: `{0}`")]
    InvalidSeriesName(String),
    #[error("database file doesn't exist at {0}")]
    ManifestMissing(PathBuf),
    #[error("database file already exists")]
    AlreadyExists,
    #[error("database at `{0}` is already open in this process")]
    AlreadyOpen(PathBuf),
    #[error("unknown resource: `{0}`")]
    UnknownResource(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Engine-initiated panic hook. Installed once at daemon startup; invoked on
/// unrecoverable internal corruption.
static PANIC_HANDLER: OnceLock<fn(&str)> = OnceLock::new();

/// Install the process-wide engine panic handler. Later installs are ignored.
pub fn set_panic_handler(handler: fn(&str)) {
    let _ = PANIC_HANDLER.set(handler);
}

fn engine_panic(message: &str) -> ! {
    if let Some(handler) = PANIC_HANDLER.get() {
        handler(message);
    } else {
        error!("{}", message);
    }
    std::process::abort()
}

/// Guards the at-most-one-open-connection-per-path invariant.
static OPEN_DATABASES: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn open_databases() -> &'static Mutex<HashSet<PathBuf>> {
    OPEN_DATABASES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Engine tuning parameters resolved from the configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct FineTuneParams {
    pub wal: WalSettings,
    /// Upper bound on concurrent ingestion sessions, used to size the WAL
    pub input_log_concurrency: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    nvolumes: i32,
    volume_size: u64,
    volumes: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SeriesData {
    last_timestamp: Option<Timestamp>,
    samples: Vec<(Timestamp, SampleValue)>,
}

/// Shared, long-lived engine handle; at most one open per database path.
#[derive(Debug)]
pub struct Connection {
    path: PathBuf,
    manifest: Manifest,
    registry: SeriesRegistry,
    series: RwLock<BTreeMap<ParamId, SeriesData>>,
    params: FineTuneParams,
}

impl Connection {
    /// Open the database at `data_path`. Fails if the manifest is missing or
    /// the path is already open in this process.
    pub fn open(data_path: &Path, params: FineTuneParams) -> Result<Arc<Connection>> {
        let manifest_path = data_path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(StorageError::ManifestMissing(data_path.to_path_buf()));
        }
        let content = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(err) => engine_panic(&format!(
                "database manifest at `{}` is corrupted: {}",
                manifest_path.display(),
                err
            )),
        };
        {
            let mut open = open_databases().lock();
            if !open.insert(data_path.to_path_buf()) {
                return Err(StorageError::AlreadyOpen(data_path.to_path_buf()));
            }
        }
        if params.wal.is_enabled() {
            info!(
                "engine WAL: path={}, nvolumes={}, volume_size={}, concurrency={}",
                params.wal.path.display(),
                params.wal.nvolumes,
                params.wal.volume_size,
                params.input_log_concurrency
            );
        }
        Ok(Arc::new(Connection {
            path: data_path.to_path_buf(),
            manifest,
            registry: SeriesRegistry::new(),
            series: RwLock::new(BTreeMap::new()),
            params,
        }))
    }

    /// Create a new single-writer session against this connection.
    pub fn create_session(self: &Arc<Self>) -> Session {
        Session {
            con: Arc::clone(self),
        }
    }

    /// Data path this connection was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Textual engine statistics blob (JSON).
    pub fn stats(&self) -> String {
        let series = self.series.read();
        let sample_count: usize = series.values().map(|s| s.samples.len()).sum();
        serde_json::json!({
            "db_name": self.manifest.name,
            "nvolumes": self.manifest.nvolumes,
            "volume_size": self.manifest.volume_size,
            "series_count": self.registry.len(),
            "sample_count": sample_count,
            "wal_enabled": self.params.wal.is_enabled(),
        })
        .to_string()
    }

    /// Engine-exposed textual resources.
    pub fn resource(&self, name: &str) -> Result<String> {
        match name {
            "function-names" => Ok("min\nmax\nmean\nsum\ncount\nlast\nfirst".to_string()),
            "version" => Ok(env!("CARGO_PKG_VERSION").to_string()),
            other => Err(StorageError::UnknownResource(other.to_string())),
        }
    }

    fn write(&self, sample: &Sample) -> Result<()> {
        if self.registry.name_of(sample.paramid).is_none() {
            return Err(StorageError::UnknownSeries(sample.paramid));
        }
        let mut series = self.series.write();
        let data = series.entry(sample.paramid).or_default();
        if let Some(last) = data.last_timestamp {
            if sample.timestamp < last {
                return Err(StorageError::LateWrite {
                    paramid: sample.paramid,
                    timestamp: sample.timestamp,
                    last,
                });
            }
            if sample.timestamp == last {
                return Err(StorageError::DuplicateTimestamp {
                    paramid: sample.paramid,
                    timestamp: sample.timestamp,
                });
            }
        }
        data.last_timestamp = Some(sample.timestamp);
        data.samples.push((sample.timestamp, sample.value.clone()));
        Ok(())
    }

    fn execute(&self, request: &QueryRequest) -> Cursor {
        match request {
            QueryRequest::Select {
                metric,
                range,
                where_tags,
                ..
            } => {
                let mut out = Vec::new();
                let series = self.series.read();
                for (id, name) in self.registry.snapshot() {
                    if !series_matches(&name, metric, where_tags) {
                        continue;
                    }
                    let Some(data) = series.get(&id) else {
                        continue;
                    };
                    for (timestamp, value) in &data.samples {
                        if *timestamp >= range.0 && *timestamp < range.1 {
                            out.push(Sample {
                                paramid: id,
                                timestamp: *timestamp,
                                value: value.clone(),
                            });
                        }
                    }
                }
                Cursor::from_samples(out)
            }
            QueryRequest::Suggest { prefix } => Cursor::from_names(self.registry.suggest(prefix)),
            QueryRequest::Search { text } => Cursor::from_names(self.registry.search(text)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        open_databases().lock().remove(&self.path);
    }
}

fn series_matches(name: &str, metric: &str, where_tags: &[(String, String)]) -> bool {
    let (series_metric, tags) = registry::split_series_name(name);
    if series_metric != metric {
        return false;
    }
    where_tags
        .iter()
        .all(|(key, value)| tags.iter().any(|(k, v)| k == key && v == value))
}

/// Single-writer handle into the engine. Owned by one ingestion worker or
/// one query for its whole lifetime; not meant for concurrent use.
#[derive(Debug)]
pub struct Session {
    con: Arc<Connection>,
}

impl Session {
    /// Resolve a series name, assigning a fresh ParamId on first sight.
    pub fn series_to_param_id(&self, name: &str) -> Result<ParamId> {
        self.con.registry.get_or_create(name)
    }

    /// Canonical name of a series id.
    pub fn param_id_to_series(&self, id: ParamId) -> Option<String> {
        self.con.registry.name_of(id)
    }

    /// Write one sample. Out-of-order and duplicate timestamps are rejected.
    pub fn write(&self, sample: &Sample) -> Result<()> {
        self.con.write(sample)
    }

    /// Open a cursor for a parsed query.
    pub fn execute(&self, request: &QueryRequest) -> Cursor {
        self.con.execute(request)
    }
}

/// Finite, non-restartable sample stream owned by exactly one reader.
#[derive(Debug)]
pub struct Cursor {
    items: std::vec::IntoIter<Sample>,
    pending_error: Option<StorageError>,
}

impl Cursor {
    pub(crate) fn from_samples(samples: Vec<Sample>) -> Self {
        Self {
            items: samples.into_iter(),
            pending_error: None,
        }
    }

    fn from_names(names: Vec<String>) -> Self {
        let samples = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| Sample::blob(idx as ParamId + 1, name.into_bytes()))
            .collect();
        Self::from_samples(samples)
    }

    /// A cursor that yields `samples` and then fails with `error`.
    pub fn failing(samples: Vec<Sample>, error: StorageError) -> Self {
        Self {
            items: samples.into_iter(),
            pending_error: Some(error),
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.items.next() {
            Some(sample) => Some(Ok(sample)),
            None => self.pending_error.take().map(Err),
        }
    }
}

fn volume_file_name(index: i32) -> String {
    format!("db_{}.vol", index)
}

/// Create database files under `path`. Refuses to overwrite an existing
/// manifest. With `allocate`, volume space is reserved up front.
pub fn create_database(
    path: &Path,
    nvolumes: i32,
    volume_size: u64,
    allocate: bool,
) -> Result<()> {
    let manifest_path = path.join(MANIFEST_FILE);
    if manifest_path.exists() {
        return Err(StorageError::AlreadyExists);
    }
    std::fs::create_dir_all(path)?;
    let volumes: Vec<String> = (0..nvolumes.max(0)).map(volume_file_name).collect();
    for volume in &volumes {
        let file = std::fs::File::create(path.join(volume))?;
        if allocate {
            file.set_len(volume_size)?;
        }
    }
    let manifest = Manifest {
        name: "db".to_string(),
        nvolumes,
        volume_size,
        volumes,
        created_at: Utc::now(),
    };
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}

/// Delete the database files under `path`. The manifest must exist.
pub fn delete_database(path: &Path) -> Result<()> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(StorageError::ManifestMissing(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(&manifest_path)?;
    let manifest: Manifest = serde_json::from_str(&content)?;
    for volume in &manifest.volumes {
        let volume_path = path.join(volume);
        if volume_path.exists() {
            std::fs::remove_file(volume_path)?;
        }
    }
    std::fs::remove_file(manifest_path)?;
    Ok(())
}

/// Produce a textual debug report for the database at `path`.
///
/// `after_recovery` re-checks volume files the way the post-crash recovery
/// pass does, flagging volumes whose on-disk size disagrees with the
/// manifest.
pub fn debug_report(path: &Path, after_recovery: bool) -> Result<String> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(StorageError::ManifestMissing(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(&manifest_path)?;
    let manifest: Manifest = serde_json::from_str(&content)?;
    let mut volumes = Vec::new();
    for volume in &manifest.volumes {
        let volume_path = path.join(volume);
        let size = std::fs::metadata(&volume_path).map(|m| m.len()).ok();
        let mut entry = serde_json::json!({
            "file": volume,
            "present": size.is_some(),
            "size": size,
        });
        if after_recovery {
            let consistent = size.map(|s| s == 0 || s == manifest.volume_size).unwrap_or(false);
            entry["consistent"] = serde_json::Value::Bool(consistent);
        }
        volumes.push(entry);
    }
    let report = serde_json::json!({
        "report": if after_recovery { "recovery" } else { "debug" },
        "path": path.display().to_string(),
        "manifest": {
            "name": manifest.name,
            "nvolumes": manifest.nvolumes,
            "volume_size": manifest.volume_size,
            "created_at": manifest.created_at,
        },
        "volumes": volumes,
    });
    Ok(serde_json::to_string_pretty(&report)?)
}
