// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! walctl - operator tool for Kestrel write-ahead log directories.
//!
//! Runs recovery, cleaner passes, stale-lock removal, watermark inspection
//! and segment listing against a log directory. Every command prints JSON
//! on stdout and exits non-zero on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};

use kestrel_wal::lock::{CLEANER_ROLE, WRITER_ROLE};
use kestrel_wal::{
    recover, CleanerConfig, DirLock, FileWatermarkStore, Lsn, SegmentIndex, SystemClock,
    TailPolicy, WalCleaner,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

/// walctl - inspect and maintain a Kestrel WAL directory.
#[derive(Parser, Debug)]
#[command(name = "walctl", version = VERSION, about = "Kestrel WAL operator tool")]
struct Cli {
    /// Log directory to operate on.
    #[arg(long, env = "KESTREL_WAL_DIR")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate every segment and apply a tail policy to the first failure.
    Recover {
        /// What to do with an unreadable tail.
        #[arg(long, value_enum, default_value_t = Policy::Strict)]
        policy: Policy,
    },

    /// Quarantine covered segments and purge expired trash.
    Clean {
        /// Sealed segments always retained.
        #[arg(long, default_value_t = 1)]
        keep_last_k: usize,

        /// Seconds a trash batch lives before it is purged.
        #[arg(long, default_value_t = 1800)]
        grace_secs: u64,

        /// Report without changing anything.
        #[arg(long)]
        dry_run: bool,

        /// Keep running passes until interrupted.
        #[arg(long)]
        watch: bool,

        /// Seconds between passes in watch mode.
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },

    /// Remove a lock left behind by a crashed process.
    Unlock {
        /// Which lock to clear.
        #[arg(long, value_enum, default_value_t = Role::Write)]
        role: Role,
    },

    /// Read or advance the persisted watermark.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },

    /// List segments with their sidecar summaries.
    Segments,
}

#[derive(Subcommand, Debug)]
enum WatermarkAction {
    /// Print the persisted watermark.
    Get,
    /// Persist a new watermark. Lower values are ignored.
    Set {
        /// The new watermark.
        lsn: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Policy {
    /// Truncate the torn tail and quarantine later segments.
    Strict,
    /// Report only; never modify files.
    Salvage,
}

impl From<Policy> for TailPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Strict => TailPolicy::StrictTruncate,
            Policy::Salvage => TailPolicy::SalvageContinue,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    /// The writer's lock.
    Write,
    /// The cleaner's lock.
    Cleaner,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Write => WRITER_ROLE,
            Role::Cleaner => CLEANER_ROLE,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run_recover(dir: &Path, policy: Policy) -> Result<Value> {
    let outcome = recover(dir, policy.into())
        .with_context(|| format!("recovery of {} failed", dir.display()))?;
    Ok(serde_json::to_value(outcome)?)
}

fn cleaner_for(dir: &Path, config: CleanerConfig) -> Result<WalCleaner> {
    let store = FileWatermarkStore::new(dir);
    Ok(WalCleaner::new(
        dir,
        config,
        Arc::new(store),
        Arc::new(SystemClock),
    )?)
}

fn run_clean(dir: &Path, config: CleanerConfig) -> Result<Value> {
    let report = cleaner_for(dir, config)?
        .run()
        .with_context(|| format!("cleaner pass on {} failed", dir.display()))?;
    Ok(serde_json::to_value(report)?)
}

fn run_clean_watch(dir: &Path, config: CleanerConfig) -> Result<()> {
    let cleaner = cleaner_for(dir, config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        let task = cleaner.spawn();
        tracing::info!("Cleaner running; press Ctrl-C to stop");
        let signal = tokio::signal::ctrl_c().await;
        task.shutdown().await;
        signal.context("failed to wait for Ctrl-C")
    })
}

fn run_unlock(dir: &Path, role: Role) -> Result<Value> {
    let displaced = DirLock::force_release(dir, role.as_str())?;
    Ok(json!({
        "role": role.as_str(),
        "released": displaced.is_some(),
        "holder": displaced,
    }))
}

fn run_watermark(dir: &Path, action: &WatermarkAction) -> Result<Value> {
    let store = FileWatermarkStore::new(dir);
    match action {
        WatermarkAction::Get => Ok(json!({ "watermark": store.load()? })),
        WatermarkAction::Set { lsn } => {
            let requested = Lsn::try_from(*lsn)?;
            let stored = store.persist(requested)?;
            Ok(json!({ "requested": requested, "watermark": stored }))
        }
    }
}

#[derive(Serialize)]
struct SegmentView {
    path: PathBuf,
    epoch: u64,
    file_size: u64,
    index: Option<SegmentIndex>,
}

fn run_segments(dir: &Path) -> Result<Value> {
    let views = kestrel_wal::segment::list_segments(dir)?
        .into_iter()
        .map(|segment| {
            let index = SegmentIndex::load(&segment.path)?;
            Ok(SegmentView {
                path: segment.path,
                epoch: segment.epoch,
                file_size: segment.file_size,
                index,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(serde_json::to_value(views)?)
}

fn execute(cli: &Cli) -> Result<Option<Value>> {
    if !cli.dir.is_dir() {
        bail!("{} is not a directory", cli.dir.display());
    }

    let output = match &cli.command {
        Command::Recover { policy } => run_recover(&cli.dir, *policy)?,
        Command::Clean {
            keep_last_k,
            grace_secs,
            dry_run,
            watch,
            interval_secs,
        } => {
            let config = CleanerConfig::default()
                .with_keep_last_k(*keep_last_k)
                .with_grace(Duration::from_secs(*grace_secs))
                .with_dry_run(*dry_run)
                .with_interval(Duration::from_secs(*interval_secs));
            if *watch {
                run_clean_watch(&cli.dir, config)?;
                return Ok(None);
            }
            run_clean(&cli.dir, config)?
        }
        Command::Unlock { role } => run_unlock(&cli.dir, *role)?,
        Command::Watermark { action } => run_watermark(&cli.dir, action)?,
        Command::Segments => run_segments(&cli.dir)?,
    };
    Ok(Some(output))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(output) = execute(&cli)? {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}
