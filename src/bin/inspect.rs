//! vmstore Inspection Binary
//!
//! Offline tooling for a single store directory (for example
//! `{storage_dir}/path_to_leaf`). Do not point it at a store that a running
//! data source has open.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};
use vmstore::collections::DEFAULT_LONG_CHUNK_SIZE;
use vmstore::{IndexedStore, MergeConfig, MergeTier};

/// vmstore store inspector
#[derive(Parser, Debug)]
#[command(name = "vmstore-inspect")]
#[command(about = "Inspect and maintain vmstore segment stores")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List segments (id, sequence, records, bytes)
    Segments {
        /// Store directory
        dir: PathBuf,
    },

    /// Re-read every record and check its CRC
    Verify {
        /// Store directory
        dir: PathBuf,
    },

    /// Run one merge and print its stats
    Compact {
        /// Store directory
        dir: PathBuf,

        /// Which segments to merge
        #[arg(short, long, value_enum, default_value = "full")]
        tier: TierArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TierArg {
    Full,
    Medium,
    Light,
}

impl From<TierArg> for MergeTier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Full => MergeTier::Full,
            TierArg::Medium => MergeTier::Medium,
            TierArg::Light => MergeTier::Light,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vmstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("vmstore-inspect v{}", vmstore::VERSION);

    if let Err(e) = run(args.command) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> vmstore::Result<()> {
    match command {
        Command::Segments { dir } => {
            let store = open_store(&dir)?;
            println!("{:>8} {:>10} {:>12} {:>14}", "id", "sequence", "records", "bytes");
            for info in store.segments() {
                println!(
                    "{:>8} {:>10} {:>12} {:>14}",
                    info.id, info.sequence, info.record_count, info.file_size
                );
            }
            println!(
                "{} segments, {} bytes, valid range {:?}",
                store.segment_count(),
                store.disk_bytes(),
                store.valid_range()
            );
        }
        Command::Verify { dir } => {
            let store = open_store(&dir)?;
            let records = store.verify()?;
            println!("OK: {} records in {} segments", records, store.segment_count());
        }
        Command::Compact { dir, tier } => {
            let store = open_store(&dir)?;
            let tier = MergeTier::from(tier);
            let filter = tier.filter(&MergeConfig::default());
            let stats = store.merge(&filter, &AtomicBool::new(false))?;
            if stats.is_noop() {
                println!("Nothing to merge at tier {}", tier.as_str());
            } else {
                println!(
                    "Merged {} segments into {}: {} records moved, {} bytes reclaimed",
                    stats.segments_in,
                    stats.segments_out,
                    stats.records_moved,
                    stats.bytes_reclaimed()
                );
            }
            store.close()?;
        }
    }
    Ok(())
}

fn open_store(dir: &Path) -> vmstore::Result<IndexedStore> {
    if !dir.is_dir() {
        return Err(vmstore::StoreError::Config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    IndexedStore::open(dir, &name, DEFAULT_LONG_CHUNK_SIZE)
}
