//! Configuration file handling
//!
//! The daemon is driven by a single TOML file (default `~/.akumulid`) with a
//! root section describing the database volumes and one optional section per
//! server (`[HTTP]`, `[TCP]`, `[UDP]`, `[OpenTSDB]`) plus `[WAL]`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::types::{ProtocolEndpoint, ServerSettings, WalSettings};

/// Default number of data volumes generated by `--init`.
pub const DEFAULT_NVOLUMES: i32 = 4;

/// Default volume size when `volume_size` is not set.
pub const DEFAULT_VOLUME_SIZE: u64 = 4 * 1024 * 1024 * 1024;

const WAL_MIN_VOLUME_SIZE: u64 = 1024 * 1024;
const WAL_MAX_VOLUME_SIZE: u64 = 1024 * 1024 * 1024;
const WAL_MAX_NVOLUMES: i32 = 1000;

/// HTTP API section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    pub port: u16,
    #[serde(default)]
    pub bind_addr: Option<String>,
}

/// TCP/UDP ingestion sections share the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    pub port: u16,
    #[serde(default)]
    pub bind_addr: Option<String>,
    /// Worker pool size; 0 means pick from hardware concurrency
    #[serde(default)]
    pub pool_size: i32,
}

/// OpenTSDB telnet section; served by the TCP server as a second endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTsdbSection {
    pub port: u16,
    #[serde(default)]
    pub bind_addr: Option<String>,
}

/// Write-ahead-log section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSection {
    pub path: String,
    #[serde(default)]
    pub nvolumes: i32,
    #[serde(default)]
    pub volume_size: Option<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Path to the database files
    pub path: String,
    /// Number of data volumes
    pub nvolumes: i32,
    /// Size of one volume; integer bytes or `MB`/`GB` suffix
    #[serde(default)]
    pub volume_size: Option<String>,
    #[serde(rename = "HTTP", default)]
    pub http: Option<HttpSection>,
    #[serde(rename = "TCP", default)]
    pub tcp: Option<IngestSection>,
    #[serde(rename = "UDP", default)]
    pub udp: Option<IngestSection>,
    #[serde(rename = "OpenTSDB", default)]
    pub opentsdb: Option<OpenTsdbSection>,
    #[serde(rename = "WAL", default)]
    pub wal: Option<WalSection>,
}

/// Resolve the configuration file location: the `--config` override or
/// `~/.akumulid`.
pub fn config_location(overridden: Option<&Path>) -> Result<PathBuf> {
    match overridden {
        Some(path) => expand_path(&path.to_string_lossy()),
        None => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            Ok(PathBuf::from(home).join(".akumulid"))
        }
    }
}

/// Expand a leading `~` against `$HOME`.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        bail!("invalid path: ``");
    }
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").context("HOME is not set")?;
        return Ok(PathBuf::from(format!("{}{}", home, rest)));
    }
    Ok(PathBuf::from(path))
}

/// Parse a size string: integer bytes, or integer with a case-insensitive
/// `MB`/`GB` suffix.
pub fn parse_size(strsize: &str) -> Result<u64> {
    let strsize = strsize.trim();
    if let Ok(bytes) = strsize.parse::<u64>() {
        return Ok(bytes);
    }
    let bytes = strsize.as_bytes();
    if bytes.len() < 3 || !matches!(bytes[bytes.len() - 1], b'B' | b'b') {
        bail!("can't decode volume size: `{}`", strsize);
    }
    let mul: u64 = match bytes[bytes.len() - 2] {
        b'G' | b'g' => 1024 * 1024 * 1024,
        b'M' | b'm' => 1024 * 1024,
        _ => bail!("can't decode volume size: `{}`", strsize),
    };
    let digits = &strsize[..strsize.len() - 2];
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("can't decode volume size: `{}`", strsize))?;
    Ok(value * mul)
}

impl ConfigFile {
    /// Read and parse the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("can't read config file `{}`", path.display());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config file `{}`", path.display()))?;
        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("can't parse config file `{}`", path.display()))?;
        Ok(config)
    }

    /// Expanded path to the database files.
    pub fn data_path(&self) -> Result<PathBuf> {
        expand_path(&self.path)
    }

    /// Volume size in bytes; defaults to 4 GB.
    pub fn volume_size(&self) -> Result<u64> {
        match &self.volume_size {
            Some(s) => parse_size(s),
            None => Ok(DEFAULT_VOLUME_SIZE),
        }
    }

    /// Extract and validate the WAL settings.
    ///
    /// A violated bound disables the WAL with an error message naming the
    /// offending key; it never aborts startup.
    pub fn wal_settings(&self) -> WalSettings {
        let section = match &self.wal {
            Some(section) => {
                info!("WAL is enabled in configuration");
                section
            }
            None => {
                info!("WAL is disabled in configuration");
                return WalSettings::default();
            }
        };
        let path = match expand_path(&section.path) {
            Ok(path) if path.exists() => path,
            Ok(path) => {
                error!(
                    "invalid configuration value WAL.path = {}, directory doesn't exist",
                    path.display()
                );
                return WalSettings::default();
            }
            Err(err) => {
                error!("invalid configuration value WAL.path: {}", err);
                return WalSettings::default();
            }
        };
        let nvolumes = section.nvolumes;
        if nvolumes < 0 || nvolumes == 1 || nvolumes > WAL_MAX_NVOLUMES {
            error!(
                "invalid configuration value WAL.nvolumes = {}, \
                 value should not exceed 1000 or be equal to 1",
                nvolumes
            );
            return WalSettings::default();
        }
        let volume_size = match section.volume_size.as_deref().map(parse_size) {
            Some(Ok(size)) => size,
            Some(Err(err)) => {
                error!("invalid configuration value WAL.volume_size: {}", err);
                return WalSettings::default();
            }
            None => 0,
        };
        if !(WAL_MIN_VOLUME_SIZE..=WAL_MAX_VOLUME_SIZE).contains(&volume_size) {
            error!(
                "invalid configuration value WAL.volume_size = {}, size should be in 1MB-1GB range",
                volume_size
            );
            return WalSettings::default();
        }
        WalSettings {
            path,
            nvolumes,
            volume_size,
        }
    }

    /// Build the `ServerSettings` list for every configured server section.
    ///
    /// The OpenTSDB endpoint rides on the TCP server as a second protocol,
    /// so `[OpenTSDB]` alone (without `[TCP]`) configures nothing.
    pub fn server_settings(&self) -> Result<Vec<ServerSettings>> {
        let mut servers = Vec::new();
        if let Some(http) = &self.http {
            servers.push(ServerSettings {
                name: "HTTP".to_string(),
                protocols: vec![ProtocolEndpoint::new(
                    "HTTP",
                    endpoint(http.bind_addr.as_deref(), http.port)?,
                )],
                nworkers: -1,
            });
        }
        if let Some(tcp) = &self.tcp {
            let mut protocols = vec![ProtocolEndpoint::new(
                "RESP",
                endpoint(tcp.bind_addr.as_deref(), tcp.port)?,
            )];
            if let Some(otsdb) = &self.opentsdb {
                protocols.push(ProtocolEndpoint::new(
                    "OpenTSDB",
                    endpoint(otsdb.bind_addr.as_deref(), otsdb.port)?,
                ));
            }
            servers.push(ServerSettings {
                name: "TCP".to_string(),
                protocols,
                nworkers: tcp.pool_size,
            });
        }
        if let Some(udp) = &self.udp {
            servers.push(ServerSettings {
                name: "UDP".to_string(),
                protocols: vec![ProtocolEndpoint::new(
                    "UDP",
                    endpoint(udp.bind_addr.as_deref(), udp.port)?,
                )],
                nworkers: udp.pool_size,
            });
        }
        Ok(servers)
    }
}

fn endpoint(bind_addr: Option<&str>, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = match bind_addr {
        Some(addr) => addr
            .parse()
            .with_context(|| format!("invalid bind_addr `{}`", addr))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Render the default configuration file contents.
pub fn default_config(nvolumes: i32, disable_wal: bool) -> String {
    let mut config = format!(
        r#"# akumulid configuration file (generated automatically).

# Path to the database files. Default value is "~/.akumuli".
path = "~/.akumuli"

# Number of volumes used to store data. Each volume is 4GB in size by
# default and allocated beforehand. To change the number of volumes
# change the `nvolumes` value and restart the daemon.
nvolumes = {nvolumes}

# Size of an individual volume. You can use an MB or GB suffix.
# Default value is "4GB" (if the value is not set).
volume_size = "4GB"


# HTTP API endpoint configuration

[HTTP]
# port number
port = 8181


# TCP ingestion server config (delete to disable)

[TCP]
# port number
port = 8282
# worker pool size (0 means that the size of the pool will be chosen automatically)
pool_size = 0


# UDP ingestion server config (delete to disable)

[UDP]
# port number
port = 8383
# worker pool size
pool_size = 1


# OpenTSDB telnet-style data connection enabled (remove this section to disable)

[OpenTSDB]
# port number
port = 4242
"#
    );
    if !disable_wal {
        config.push_str(
            r#"

# Write-Ahead-Log section (delete to disable)

[WAL]
# WAL location
path = "~/.akumuli"

# Max volume size. Log records are appended until the file size
# exceeds the configured value.
volume_size = "256MB"

# Number of log volumes to keep on disk.
nvolumes = 4
"#,
        );
    }
    config
}

/// Write the default configuration to `path`; refuses to overwrite.
pub fn init_config(path: &Path, nvolumes: i32, disable_wal: bool) -> Result<()> {
    if path.exists() {
        bail!("configuration file already exists");
    }
    std::fs::write(path, default_config(nvolumes, disable_wal))
        .with_context(|| format!("can't write config file `{}`", path.display()))?;
    Ok(())
}
