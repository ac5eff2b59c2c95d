//! akumulid daemon entry point
//!
//! Commands are mutually exclusive flags; with no command the daemon reads
//! its configuration, opens the database, and runs every configured server
//! until SIGINT/SIGTERM.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use akumulid::config::{self, ConfigFile};
use akumulid::query::{QueryProcessor, DEFAULT_RDBUF_SIZE};
use akumulid::server;
use akumulid::signal::SignalHandler;
use akumulid::storage::{self, FineTuneParams};

/// Read-buffer size handed to the query processor, in sample records.
const QUERY_RDBUF_SIZE: usize = 2 * DEFAULT_RDBUF_SIZE;

/// Help message rendered with the markdown-subset formatter.
const CLI_HELP_MESSAGE: &str = r#"`akumulid` - time-series database daemon

**SYNOPSIS**
        akumulid

        akumulid --help

        akumulid --init

        akumulid --init-expandable

        akumulid --create

        akumulid --delete

**DESCRIPTION**
        **akumulid** is a time-series database daemon.
        All configuration can be done via the `~/.akumulid` configuration
        file.

**OPTIONS**
        **help**
            produce help message and exit

        **version**
            print software version and exit

        **config**
            use the configuration file at the supplied path

        **init**
            create configuration file at `~/.akumulid` filled with
            default values and exit

        **init-expandable**
            create configuration file at `~/.akumulid` filled with
            default values and exit (sets nvolumes to 0)

        **disable-wal**
            omit the WAL section from the generated configuration
            (use with --init)

        **create**
            generate database files in `~/.akumuli` folder, use with
            --allocate flag to actually allocate disk space

        **CI**
            create database with a small volume size (for testing)

        **delete**
            delete database files in `~/.akumuli` folder

        **debug-dump**
            dump the engine debug report to the supplied file or `stdout`

        **debug-recovery-dump**
            dump the post-recovery debug report to the supplied file or
            `stdout`

        **(empty)**
            run server
"#;

#[derive(Parser, Debug)]
#[command(name = "akumulid", version, disable_help_flag = true)]
struct Cli {
    /// Produce help message
    #[arg(long)]
    help: bool,
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Create default configuration and exit
    #[arg(long)]
    init: bool,
    /// Create configuration for expandable storage and exit
    #[arg(long = "init-expandable")]
    init_expandable: bool,
    /// Disable WAL in the generated configuration file (use with --init)
    #[arg(long = "disable-wal")]
    disable_wal: bool,
    /// Create database files
    #[arg(long)]
    create: bool,
    /// Preallocate disk space (use with --create)
    #[arg(long)]
    allocate: bool,
    /// Create database for CI environment (for testing)
    #[arg(long = "CI")]
    ci: bool,
    /// Delete database files
    #[arg(long)]
    delete: bool,
    /// Create debug dump
    #[arg(long = "debug-dump", value_name = "FILE|stdout")]
    debug_dump: Option<String>,
    /// Create debug dump of the system after crash recovery
    #[arg(long = "debug-recovery-dump", value_name = "FILE|stdout")]
    debug_recovery_dump: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
    storage::set_panic_handler(engine_panic_handler);

    if let Err(err) = run(cli).await {
        eprintln!("{}", cli_format(&format!("**FAILURE** {}", err)));
        std::process::exit(1);
    }
}

/// Invoked by the engine on unrecoverable corruption; the engine aborts
/// right after this returns.
fn engine_panic_handler(message: &str) {
    tracing::error!("{}", message);
    tracing::error!("Terminating (core dumped)");
}

async fn run(cli: Cli) -> Result<()> {
    if cli.help {
        rich_print(CLI_HELP_MESSAGE);
        return Ok(());
    }

    let config_path = config::config_location(cli.config.as_deref())?;

    if cli.init || cli.init_expandable {
        let nvolumes = if cli.init_expandable {
            0
        } else {
            config::DEFAULT_NVOLUMES
        };
        config::init_config(&config_path, nvolumes, cli.disable_wal)?;
        println!(
            "{}",
            cli_format(&format!(
                "**OK** configuration file created at: `{}`",
                config_path.display()
            ))
        );
        return Ok(());
    }
    if cli.create || cli.ci {
        return cmd_create_database(&config_path, cli.ci, cli.allocate);
    }
    if cli.delete {
        return cmd_delete_database(&config_path);
    }
    if let Some(target) = &cli.debug_dump {
        return cmd_debug_dump(&config_path, target, false);
    }
    if let Some(target) = &cli.debug_recovery_dump {
        return cmd_debug_dump(&config_path, target, true);
    }
    cmd_run_server(&config_path).await
}

fn cmd_create_database(config_path: &Path, test_db: bool, allocate: bool) -> Result<()> {
    let config = ConfigFile::load(config_path)?;
    let path = config.data_path()?;
    let volume_size = if test_db {
        storage::TEST_DB_VOLUME_SIZE
    } else {
        config.volume_size()?
    };
    storage::create_database(&path, config.nvolumes, volume_size, allocate)
        .context("can't create database")?;
    println!(
        "{}",
        cli_format(&format!("**OK** database created, path: `{}`", path.display()))
    );
    Ok(())
}

fn cmd_delete_database(config_path: &Path) -> Result<()> {
    let config = ConfigFile::load(config_path)?;
    let path = config.data_path()?;
    storage::delete_database(&path).context("can't delete database")?;
    println!(
        "{}",
        cli_format(&format!("**OK** database at `{}` deleted", path.display()))
    );
    Ok(())
}

fn cmd_debug_dump(config_path: &Path, target: &str, after_recovery: bool) -> Result<()> {
    let config = ConfigFile::load(config_path)?;
    let path = config.data_path()?;
    let report = storage::debug_report(&path, after_recovery).context("can't dump debug info")?;
    if target == "stdout" {
        // No status line here so `--debug-dump=stdout >> report.json` stays clean
        println!("{}", report);
    } else {
        std::fs::write(target, report)
            .with_context(|| format!("can't write debug report to `{}`", target))?;
        println!(
            "{}",
            cli_format(&format!(
                "**OK** `{}` successfully generated for `{}`",
                target,
                path.display()
            ))
        );
    }
    Ok(())
}

async fn cmd_run_server(config_path: &Path) -> Result<()> {
    let config = ConfigFile::load(config_path)?;
    let path = config.data_path()?;
    if !path.join(storage::MANIFEST_FILE).exists() {
        bail!("database file doesn't exist at `{}`", path.display());
    }

    let server_settings = config.server_settings()?;
    if server_settings.is_empty() {
        bail!("no servers configured in `{}`", config_path.display());
    }
    let wal = config.wal_settings();
    let input_log_concurrency = server_settings
        .iter()
        .map(|settings| settings.pool_size())
        .max()
        .unwrap_or(1) as u32;

    let con = storage::Connection::open(
        &path,
        FineTuneParams {
            wal,
            input_log_concurrency,
        },
    )?;
    let qproc = Arc::new(QueryProcessor::new(&con, QUERY_RDBUF_SIZE));

    server::register_all();
    let mut sig = SignalHandler::new();
    let mut names: HashMap<u32, String> = HashMap::new();
    for (id, settings) in server_settings.iter().enumerate() {
        let id = id as u32;
        let srv = server::create_server(con.clone(), qproc.clone(), settings)?;
        srv.start(&mut sig, id).await?;
        names.insert(id, settings.name.clone());
        let endpoints = settings
            .protocols
            .iter()
            .map(|p| format!("{} endpoint: {}", p.name, p.addr))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} {} server started, {}",
            cli_format("**OK**"),
            settings.name,
            endpoints
        );
        tracing::info!("starting {} index {}", settings.name, id);
    }

    let stopped = sig.wait().await;
    for id in stopped {
        if let Some(name) = names.get(&id) {
            println!("{} {} server stopped", cli_format("**OK**"), name);
        }
    }
    Ok(())
}

/// Render the markdown subset (`**bold**`, `__emphasis__`, `` `underline` ``)
/// as console escape codes; plain text when stdout is not a TTY.
fn cli_format(text: &str) -> String {
    let plain = unsafe { libc::isatty(libc::STDOUT_FILENO) } == 0;
    render_markdown(text, plain)
}

fn render_markdown(text: &str, plain: bool) -> String {
    const BOLD: &str = "\x1b[1m";
    const EMPH: &str = "\x1b[3m";
    const UNDR: &str = "\x1b[4m";
    const NORM: &str = "\x1b[0m";

    let (bold, emph, undr, norm) = if plain {
        ("", "", "", "")
    } else {
        (BOLD, EMPH, UNDR, NORM)
    };
    let text = format_spans(text, "**", bold, norm);
    let text = format_spans(&text, "__", emph, norm);
    format_spans(&text, "`", undr, norm)
}

/// Replace alternating occurrences of `pattern` with `open`/`close`.
fn format_spans(text: &str, pattern: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut opened = false;
    while let Some(pos) = rest.find(pattern) {
        out.push_str(&rest[..pos]);
        out.push_str(if opened { close } else { open });
        opened = !opened;
        rest = &rest[pos + pattern.len()..];
    }
    out.push_str(rest);
    out
}

fn rich_print(message: &str) {
    for line in message.lines() {
        println!("{}", cli_format(line));
    }
}
