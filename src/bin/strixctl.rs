//! Command-line tool for inspecting and maintaining a strix data directory.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`STRIX_*`, nested keys separated by `__`), and CLI flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use strix::block::{block_dirs, read_meta};
use strix::{Db, DbConfig, Matcher, Querier, TracingEventListener};
use tracing_subscriber::EnvFilter;

// ---------- CLI ----------

/// strix time-series storage tool.
#[derive(Parser, Debug)]
#[command(name = "strixctl", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `strix.toml` is loaded when present.
    #[arg(long, env = "STRIX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override data directory.
    #[arg(long, env = "STRIX_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false, global = true)]
    pub no_config: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List persisted blocks without opening the database.
    Ls,
    /// Print every sample of the series selected by the matchers.
    Query {
        /// Matchers such as `job=api`, `job!=api`, `path=~/v1/.*`, `path!~/internal.*`.
        #[arg(required = true)]
        matchers: Vec<String>,
        #[arg(long, default_value_t = i64::MIN, allow_hyphen_values = true)]
        min_time: i64,
        #[arg(long, default_value_t = i64::MAX, allow_hyphen_values = true)]
        max_time: i64,
    },
    /// Persist the head and compact blocks until nothing is left to do.
    Compact,
    /// Rewrite blocks without their deleted data.
    CleanTombstones,
    /// Write a hard-linked copy of all blocks into a directory.
    Snapshot {
        dir: PathBuf,
        /// Also persist the in-memory head into the snapshot.
        #[arg(long, default_value_t = false)]
        with_head: bool,
    },
    /// Load and validate config (file + env + CLI), print it, then exit. Does not open the DB.
    ValidateConfig,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct FileConfig {
    pub data_dir: Option<String>,
    pub wal_segment_size: Option<u64>,
    pub wal_sync: Option<bool>,
    pub retention_ms: Option<i64>,
    pub block_ranges: Option<Vec<i64>>,
    pub no_lockfile: Option<bool>,
    pub compaction_interval_secs: Option<u64>,
    pub max_compaction_backoff_secs: Option<u64>,
}

#[derive(Debug)]
struct Settings {
    data_dir: PathBuf,
    db: DbConfig,
}

fn load_config(cli: &Cli) -> Result<Settings, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(true));
        } else {
            let default_path = PathBuf::from("strix.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("STRIX")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("block_ranges")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: FileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut db = DbConfig {
        event_listener: Arc::new(TracingEventListener),
        ..DbConfig::default()
    };
    merge_into_db_config(&mut db, &partial);
    db.validate().map_err(|e| e.to_string())?;

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| partial.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));
    Ok(Settings { data_dir, db })
}

/// Merge file/env partial config onto `DbConfig`. Only overwrites fields that are `Some`.
fn merge_into_db_config(base: &mut DbConfig, partial: &FileConfig) {
    if let Some(n) = partial.wal_segment_size {
        base.wal_segment_size = n;
    }
    if let Some(b) = partial.wal_sync {
        base.wal_sync = b;
    }
    if let Some(ms) = partial.retention_ms {
        base.retention_duration = ms;
    }
    if let Some(ref r) = partial.block_ranges {
        base.block_ranges = r.clone();
    }
    if let Some(b) = partial.no_lockfile {
        base.no_lockfile = b;
    }
    if let Some(secs) = partial.compaction_interval_secs {
        base.compaction_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = partial.max_compaction_backoff_secs {
        base.max_compaction_backoff = Duration::from_secs(secs);
    }
}

// ---------- Commands ----------

fn list_blocks(data_dir: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!(
        "{:<26}  {:>15}  {:>15}  {:>10}  {:>8}  {:>8}  {:>5}",
        "ULID", "MIN TIME", "MAX TIME", "SAMPLES", "SERIES", "CHUNKS", "LEVEL"
    );
    if !data_dir.exists() {
        return Ok(());
    }
    for dir in block_dirs(data_dir)? {
        let meta = read_meta(&dir)?;
        println!(
            "{:<26}  {:>15}  {:>15}  {:>10}  {:>8}  {:>8}  {:>5}",
            meta.ulid.to_string(),
            meta.min_time,
            meta.max_time,
            meta.stats.num_samples,
            meta.stats.num_series,
            meta.stats.num_chunks,
            meta.compaction.level
        );
    }
    Ok(())
}

fn query(
    db: &Db,
    matchers: &[String],
    mint: i64,
    maxt: i64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let matchers = matchers
        .iter()
        .map(|m| Matcher::parse(m))
        .collect::<Result<Vec<_>, _>>()?;
    let mut q = db.querier(mint, maxt)?;
    let mut res = Ok(());
    for s in q.select(&matchers) {
        let s = match s {
            Ok(s) => s,
            Err(e) => {
                res = Err(e);
                break;
            }
        };
        println!("{}", s.labels());
        for (t, v) in s.iter() {
            println!("  {} {}", t, v);
        }
    }
    q.close()?;
    Ok(res?)
}

fn open_db(settings: Settings) -> Result<Db, Box<dyn std::error::Error + Send + Sync>> {
    let db = Db::open(&settings.data_dir, settings.db).map_err(|e| {
        eprintln!("failed to open database: {}", e);
        e
    })?;
    // Maintenance commands run compactions explicitly.
    db.set_compactions_enabled(false);
    Ok(db)
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    match cli.command {
        Command::ValidateConfig => {
            println!("data_dir={}", settings.data_dir.display());
            println!("wal_segment_size={}", settings.db.wal_segment_size);
            println!("wal_sync={}", settings.db.wal_sync);
            println!("retention_ms={}", settings.db.retention_duration);
            let ranges: Vec<String> = settings.db.block_ranges.iter().map(|r| r.to_string()).collect();
            println!("block_ranges={}", ranges.join(","));
            println!("compaction_interval_secs={}", settings.db.compaction_interval.as_secs());
            Ok(())
        }
        Command::Ls => list_blocks(&settings.data_dir),
        Command::Query {
            matchers,
            min_time,
            max_time,
        } => {
            let db = open_db(settings)?;
            let res = query(&db, &matchers, min_time, max_time);
            db.close()?;
            res
        }
        Command::Compact => {
            let db = open_db(settings)?;
            let res = db.compact();
            db.close()?;
            Ok(res?)
        }
        Command::CleanTombstones => {
            let db = open_db(settings)?;
            let res = db.clean_tombstones();
            db.close()?;
            Ok(res?)
        }
        Command::Snapshot { dir, with_head } => {
            let db = open_db(settings)?;
            let res = db.snapshot(&dir, with_head);
            db.close()?;
            Ok(res?)
        }
    }
}
