//! gstore - offline tool for the gstore transaction log
//!
//! Inspects a store's log and shows what recovery would do at the next
//! startup. Nothing here writes to the store.

use clap::{Parser, Subcommand};
use colored::Colorize;
use gstore_log::{LogEntry, LogEntryReader, LogVersion, ReadOutcome};
use gstore_recovery::{
    locate_start, plan_recovery, InMemoryTransactionIdStore, JsonTransactionIdStore,
    RecoveryConfig, TransactionIdStore, TX_ID_STORE_FILE,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gstore")]
#[command(about = "Offline inspection of the gstore transaction log")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "GSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (overrides the configuration)
    #[arg(short, long)]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the log tail and whether recovery is required
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List log entries
    Dump {
        /// Only this log version
        #[arg(short = 'v', long)]
        version: Option<LogVersion>,

        /// Maximum entries to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Validate the tail and report what recovery would replay and quarantine
    Recover {
        /// Required: the tool never modifies the store
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Status { json } => status(&config, json),
        Commands::Dump { version, limit } => dump(&config, version, limit),
        Commands::Recover { dry_run } => {
            if !dry_run {
                eprintln!(
                    "{}: recovery runs inside the engine at startup; pass --dry-run to preview it",
                    "Error".red()
                );
                std::process::exit(2);
            }
            recover_dry_run(&config)
        }
    }
}

fn load_config(cli: &Cli) -> Result<RecoveryConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = RecoveryConfig::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => RecoveryConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(dir) = &cli.store_dir {
        config.store_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Opens the id store without creating it.
fn open_id_store(
    config: &RecoveryConfig,
) -> Result<Box<dyn TransactionIdStore>, Box<dyn std::error::Error>> {
    let path = config.store_dir.join(TX_ID_STORE_FILE);
    if path.exists() {
        Ok(Box::new(JsonTransactionIdStore::open(path, None)?))
    } else {
        tracing::debug!("No {} found, assuming an empty store", path.display());
        Ok(Box::new(InMemoryTransactionIdStore::new(None)))
    }
}

fn status(config: &RecoveryConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ids = open_id_store(config)?;
    let (tail, start) = locate_start(config, ids.as_ref())?;

    if json {
        let value = serde_json::json!({
            "log_dir": config.log_dir(),
            "store_id": tail.store_id.map(|id| id.to_string()),
            "end_position": tail.end_position.map(|p| p.to_string()),
            "last_check_point": tail.last_check_point.as_ref().map(|cp| serde_json::json!({
                "position": cp.position.to_string(),
                "target": cp.target().to_string(),
                "reason": cp.entry.reason,
            })),
            "last_committed_tx_id": tail.last_committed_tx_id,
            "commits_after_last_check_point": tail.commits_after_last_check_point,
            "corruption": tail.corruption.as_ref().map(|c| serde_json::json!({
                "position": c.position.to_string(),
                "reason": c.reason,
            })),
            "recovery_required": start.recovery_required,
            "recovery_start": start.recovery_required.then(|| start.position.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Log directory: {}", config.log_dir().display().to_string().cyan());
    match tail.store_id {
        Some(id) => println!("Store id:      {}", id),
        None => println!("Store id:      {}", "no log files".yellow()),
    }
    if let Some(end) = tail.end_position {
        println!("Log end:       {}", end);
    }
    match &tail.last_check_point {
        Some(cp) => println!(
            "Checkpoint:    {} -> {} ({})",
            cp.position, cp.target(), cp.entry.reason
        ),
        None => println!("Checkpoint:    {}", "none".yellow()),
    }
    if let Some(tx_id) = tail.last_committed_tx_id {
        println!("Last commit:   tx {}", tx_id);
    }
    if let Some(corruption) = &tail.corruption {
        println!(
            "Corruption:    {} at {}",
            corruption.reason.red(),
            corruption.position
        );
    }

    if start.recovery_required {
        println!("{}", start.to_string().yellow());
    } else {
        println!("{}", start.to_string().green());
    }
    Ok(())
}

fn dump(
    config: &RecoveryConfig,
    only: Option<LogVersion>,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let files = config.log_files();
    let versions: Vec<LogVersion> = files
        .versions()?
        .into_iter()
        .filter(|v| only.map_or(true, |only| only == *v))
        .collect();
    if versions.is_empty() {
        println!("{}", "No log files".yellow());
        return Ok(());
    }

    let mut printed = 0;
    for version in versions {
        let mut reader = LogEntryReader::open_at_start(&files, version)?;
        println!(
            "{} (store {}, previous last committed tx {})",
            files.file_name(version).cyan(),
            reader.header().store_id,
            reader.header().last_committed_tx_id
        );

        loop {
            if limit.is_some_and(|limit| printed >= limit) {
                return Ok(());
            }
            match reader.next_entry()? {
                ReadOutcome::Entry(entry) => {
                    println!("  {}  {}", entry.position, describe(&entry.entry));
                    printed += 1;
                }
                ReadOutcome::EndOfFile(_) => break,
                ReadOutcome::Unreadable { position, reason } => {
                    println!("  {}  {}: {}", position, "UNREADABLE".red(), reason);
                    break;
                }
            }
        }
    }
    Ok(())
}

fn describe(entry: &LogEntry) -> String {
    match entry {
        LogEntry::Start(start) => format!(
            "{} flags={:#04x} prev_checksum={:#010x} last_committed={}",
            "START".yellow(),
            start.batch_flags,
            start.previous_checksum,
            start.last_committed_tx_id
        ),
        LogEntry::Command(command) => {
            format!("{} {} bytes", "COMMAND".normal(), command.payload.len())
        }
        LogEntry::Commit(commit) => format!(
            "{} tx={} chunk={} flags={:#04x} checksum={:#010x}",
            "COMMIT".green(),
            commit.tx_id,
            commit.chunk_index,
            commit.batch_flags,
            commit.checksum
        ),
        LogEntry::CheckPoint(cp) => format!(
            "{} target={} reason={:?}",
            "CHECKPOINT".cyan(),
            cp.target,
            cp.reason
        ),
    }
}

fn recover_dry_run(config: &RecoveryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ids = open_id_store(config)?;
    let plan = plan_recovery(config, ids.as_ref())?;

    let Some(valid) = &plan.valid_tail else {
        println!("{}", plan.start.to_string().green());
        return Ok(());
    };

    println!("Recovery starts at {}", plan.start.position);
    println!(
        "Would replay {} batches ({} complete transactions)",
        valid.batches, valid.transactions
    );
    println!("Valid tail:  {}", valid.position);
    for tx_id in &valid.incomplete {
        println!("  {} tx {} never completed", "Dropped".yellow(), tx_id);
    }
    if let Some(corruption) = &valid.corruption {
        println!(
            "  {} at {}: {}",
            "Corrupted".red(),
            corruption.position,
            corruption.reason
        );
    }

    let bytes = plan.bytes_to_quarantine(&config.log_files())?;
    if bytes > 0 {
        println!(
            "Would quarantine {} bytes into {}",
            bytes,
            config.quarantine_dir().display()
        );
    } else {
        println!("Nothing to quarantine");
    }
    Ok(())
}
