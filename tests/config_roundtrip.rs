//! Configuration round-trips through the generated default file

use tempfile::TempDir;

use akumulid::config::{self, ConfigFile};
use akumulid::storage::{self, Connection, FineTuneParams};

#[test]
fn generated_config_parses_back_with_documented_defaults() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".akumulid");
    config::init_config(&path, config::DEFAULT_NVOLUMES, false).unwrap();
    assert!(path.exists());

    let cfg = ConfigFile::load(&path).unwrap();
    assert_eq!(cfg.path, "~/.akumuli");
    assert_eq!(cfg.nvolumes, 4);
    assert_eq!(cfg.volume_size().unwrap(), 4 * 1024 * 1024 * 1024);
    assert_eq!(cfg.http.as_ref().unwrap().port, 8181);
    assert_eq!(cfg.tcp.as_ref().unwrap().port, 8282);
    assert_eq!(cfg.udp.as_ref().unwrap().port, 8383);
    assert_eq!(cfg.opentsdb.as_ref().unwrap().port, 4242);

    let servers = cfg.server_settings().unwrap();
    let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["HTTP", "TCP", "UDP"]);
}

#[test]
fn size_parser_accepts_the_documented_grammar() {
    assert_eq!(config::parse_size("4GB").unwrap(), 4 * (1 << 30));
    assert_eq!(config::parse_size("256MB").unwrap(), 256 * (1 << 20));
    assert_eq!(config::parse_size("1024").unwrap(), 1024);
    assert_eq!(config::parse_size("4gb").unwrap(), 4 * (1 << 30));
    assert!(config::parse_size("4XB").is_err());
    assert!(config::parse_size("GB").is_err());
}

#[test]
fn wal_misconfig_disables_wal_but_does_not_abort() {
    let tmp = TempDir::new().unwrap();
    let config_text = format!(
        r#"
path = "{data}"
nvolumes = 4

[WAL]
path = "{data}"
nvolumes = 1
volume_size = "256MB"
"#,
        data = tmp.path().display()
    );
    let config_path = tmp.path().join("akumulid.toml");
    std::fs::write(&config_path, config_text).unwrap();

    let cfg = ConfigFile::load(&config_path).unwrap();
    let wal = cfg.wal_settings();
    assert!(!wal.is_enabled(), "WAL.nvolumes=1 must disable the WAL");
}

#[test]
fn init_create_open_flow_works_from_a_config_file() {
    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    let config_text = format!(
        r#"
path = "{}"
nvolumes = 2
volume_size = "1MB"
"#,
        data_dir.display()
    );
    let config_path = tmp.path().join("akumulid.toml");
    std::fs::write(&config_path, config_text).unwrap();

    let cfg = ConfigFile::load(&config_path).unwrap();
    let path = cfg.data_path().unwrap();
    storage::create_database(&path, cfg.nvolumes, cfg.volume_size().unwrap(), false).unwrap();
    assert!(path.join(storage::MANIFEST_FILE).exists());

    let con = Connection::open(&path, FineTuneParams::default()).unwrap();
    drop(con);
    storage::delete_database(&path).unwrap();
    assert!(!path.join(storage::MANIFEST_FILE).exists());
}
