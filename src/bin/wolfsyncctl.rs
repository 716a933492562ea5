//! WolfSyncCtl - Offline inspection tool for WolfSync data
//!
//! Usage:
//!   wolfsyncctl dump --index 3              - Decode records of binlog segment 3
//!   wolfsyncctl mark --peer 100002          - Show a peer's sync checkpoint
//!   wolfsyncctl validate                    - Check the configuration file

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::binlog::{BinlogPaths, BinlogRecord, SegmentIndex};
use wolfsync::state::PeerInfo;
use wolfsync::sync::{MarkStore, ReaderCursor};
use wolfsync::WolfSyncConfig;

/// WolfSync Inspection Tool
#[derive(Parser)]
#[command(name = "wolfsyncctl")]
#[command(author, version, about = "Inspect WolfSync binlogs and checkpoints", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wolfsync/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode the records of a binlog segment
    Dump {
        /// Segment index (defaults to the segment being written)
        #[arg(short, long)]
        index: Option<u32>,
        /// Byte offset to start from
        #[arg(short, long, default_value_t = 0)]
        offset: u64,
        /// Stop after this many records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show the sync checkpoint of a peer
    Mark {
        /// Peer storage id
        #[arg(short, long)]
        peer: Option<String>,
        /// Peer IP address, for `ip_port` mark files
        #[arg(long)]
        ip: Option<String>,
        /// Peer port, for `ip_port` mark files
        #[arg(long)]
        port: Option<u16>,
        /// Read this mark file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate the configuration file
    Validate,
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command {
        Commands::Dump {
            index,
            offset,
            limit,
            json,
        } => run_dump(&cli.config, index, offset, limit, json),
        Commands::Mark {
            peer,
            ip,
            port,
            file,
            json,
        } => run_mark(&cli.config, peer, ip, port, file, json),
        Commands::Validate => run_validate(&cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<WolfSyncConfig> {
    WolfSyncConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn run_dump(config: &Path, index: Option<u32>, offset: u64, limit: Option<usize>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let paths = BinlogPaths::new(config.sync_dir());

    let index = match index {
        Some(index) => index,
        None => SegmentIndex::load(&paths.index_path())?
            .map_or(0, |segment_index| segment_index.current_write),
    };

    let path = paths.segment_path(index);
    let mut file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;

    let mut reader = BufReader::new(file);
    let mut position = offset;
    let mut line = String::new();
    let mut shown = 0;
    let mut invalid = 0;

    while limit.map_or(true, |limit| shown < limit) {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        let at = position;
        position += read as u64;

        if !line.ends_with('\n') {
            println!("{:>10}  (incomplete line, {} bytes)", at, read);
            break;
        }

        match BinlogRecord::parse_line(line.trim_end_matches('\n')) {
            Ok(record) if json => {
                let entry = serde_json::json!({ "offset": at, "record": record });
                println!("{}", entry);
            }
            Ok(record) => println!("{:>10}  {}", at, record),
            Err(reason) => {
                invalid += 1;
                println!("{:>10}  INVALID: {} ({:?})", at, reason, line.trim_end());
            }
        }
        shown += 1;
    }

    if !json {
        println!();
        println!("Segment {}: {} records from offset {} to {}, {} invalid", index, shown, offset, position, invalid);
    }
    Ok(())
}

fn run_mark(
    config: &Path,
    peer: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let (path, cursor) = match file {
        Some(path) => {
            let content = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            (path, ReaderCursor::parse(&content)?)
        }
        None => {
            let config = load_config(config)?;
            let use_storage_id = config.node.use_storage_id && peer.is_some();
            let peer = match (peer, ip) {
                (Some(id), ip) => PeerInfo::new(id, ip.unwrap_or_default(), port.unwrap_or(config.node.port)),
                (None, Some(ip)) => PeerInfo::new("", ip, port.unwrap_or(config.node.port)),
                (None, None) => bail!("either --peer, --ip or --file is required"),
            };
            let marks = MarkStore::new(config.sync_dir(), use_storage_id);
            match marks.peek(&peer)? {
                Some(found) => found,
                None => bail!("no mark file at {}", marks.path_for(&peer).display()),
            }
        }
    };

    if json {
        let entry = serde_json::json!({
            "file": path,
            "position": cursor.position,
            "need_sync_old": cursor.replay_old,
            "sync_old_done": cursor.replay_done,
            "until_timestamp": cursor.until_timestamp,
            "scan_row_count": cursor.scan_row_count,
            "sync_row_count": cursor.sync_row_count,
        });
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }

    println!("Mark file:       {}", path.display());
    println!("Position:        {}", cursor.position);
    println!("Replay history:  {}", if cursor.replay_old { "yes" } else { "no" });
    println!("Replay done:     {}", if cursor.replay_done { "yes" } else { "no" });
    if cursor.until_timestamp > 0 {
        let until = chrono::DateTime::from_timestamp(cursor.until_timestamp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| cursor.until_timestamp.to_string());
        println!("Until:           {}", until);
    }
    println!("Scanned rows:    {}", cursor.scan_row_count);
    println!("Synced rows:     {}", cursor.sync_row_count);
    Ok(())
}

fn run_validate(config: &Path) -> Result<()> {
    let config = load_config(config)?;

    println!("Config OK: {}", config.node.id);
    println!("  Group:          {}", config.node.group_name);
    println!("  Sync dir:       {}", config.sync_dir().display());
    println!("  Store paths:    {}", config.node.store_paths.len());
    println!("  Workers/peer:   {}", config.sync.max_workers);
    println!("  Logging:        {} ({})", config.logging.level, config.logging.format);
    match config.sync.sync_window()? {
        Some((start, end)) => println!(
            "  Sync window:    {:02}:{:02}-{:02}:{:02}",
            start.hour, start.minute, end.hour, end.minute
        ),
        None => println!("  Sync window:    all day"),
    }

    for (i, path) in config.node.store_paths.iter().enumerate() {
        if !path.exists() {
            println!("  Warning: store path M{:02X} {} does not exist", i, path.display());
        }
    }
    Ok(())
}
