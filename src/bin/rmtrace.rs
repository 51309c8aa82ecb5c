use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use rmtrace::cancel::{CancelToken, Progress};
use rmtrace::snapshot::{self, Snapshot};
use rmtrace::writer::{container, legacy};
use rmtrace::{BuildConfig, DataSet};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "rmtrace")]
#[command(about = "Inspect GPU memory traces: snapshots, resource history and aliasing")]
struct Cli {
    /// Trace file (legacy or container layout)
    #[arg(long, global = true)]
    trace: Option<PathBuf>,

    /// Build configuration as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise the trace and its build
    Inspect,
    /// Snapshot the memory state at a timestamp
    Snapshot {
        /// Timestamp in trace ticks
        #[arg(long)]
        at: u64,
    },
    /// Events touching one resource
    History {
        /// Resource identifier
        #[arg(long)]
        id: u64,

        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        to: Option<u64>,
    },
    /// Aliasing components at a timestamp, or a timeline with --buckets
    Aliasing {
        #[arg(long, conflicts_with = "buckets")]
        at: Option<u64>,

        #[arg(long)]
        buckets: Option<usize>,
    },
    /// Live allocations within a byte-size range at a timestamp
    Allocations {
        #[arg(long)]
        at: u64,

        #[arg(long, default_value_t = 0)]
        min: u64,

        #[arg(long, default_value_t = u64::MAX)]
        max: u64,
    },
    /// Differences between two snapshots
    Compare {
        #[arg(long)]
        base: u64,

        #[arg(long)]
        diff: u64,
    },
    /// Store a snapshot next to the trace
    WriteSnapshot {
        #[arg(long)]
        at: u64,

        #[arg(long, default_value = "snapshot")]
        name: String,

        /// Destination file
        #[arg(long)]
        output: PathBuf,

        /// Append to a copy of the trace instead of writing a standalone blob
        #[arg(long)]
        container: bool,
    },
}

#[derive(Serialize)]
struct SnapshotReport<'a> {
    name: &'a str,
    timestamp: u64,
    digest: String,
    virtual_allocations: usize,
    physical_allocations: usize,
    resources: usize,
    aliased_components: usize,
    segments: &'a [snapshot::SegmentTotals],
    usage: Vec<&'a snapshot::UsageTotals>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn report(snapshot: &Snapshot) -> SnapshotReport<'_> {
    SnapshotReport {
        name: snapshot.name(),
        timestamp: snapshot.timestamp(),
        digest: hex(&snapshot.digest()),
        virtual_allocations: snapshot.virtual_allocations().count(),
        physical_allocations: snapshot.physical_allocations().count(),
        resources: snapshot.resources().count(),
        aliased_components: snapshot.aliasing().aliased_components().count(),
        segments: snapshot.segment_totals(),
        usage: snapshot
            .usage_totals()
            .iter()
            .filter(|totals| totals.count > 0)
            .collect(),
    }
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

fn open(path: &Path, config: Option<&Path>) -> Result<DataSet> {
    let config = match config {
        Some(path) => BuildConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BuildConfig::default(),
    };
    let mut dataset = DataSet::open_with_config(path, config)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut last_decile = 0;
    let mut progress = |p: Progress| {
        let decile = (p.fraction() * 10.0) as u32;
        if decile > last_decile {
            last_decile = decile;
            info!("{:?}: {}%", p.phase, decile * 10);
        }
        true
    };
    dataset
        .build(&mut progress, &CancelToken::new())
        .context("building data set")?;
    Ok(dataset)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let Some(trace) = cli.trace.as_deref() else {
        bail!("--trace is required");
    };
    let dataset = open(trace, cli.config.as_deref())?;

    match cli.command {
        Commands::Inspect => {
            #[derive(Debug, Serialize)]
            struct Summary<'a> {
                streams: usize,
                segments: &'a rmtrace::format::SegmentTable,
                time_range: (u64, u64),
                stats: rmtrace::state::BuildStats,
                unresolved_names: usize,
                waiting_correlations: usize,
                snapshot_points: &'a [rmtrace::SnapshotPoint],
            }
            let user_data = &dataset.final_state()?.user_data;
            print(
                cli.json,
                &Summary {
                    streams: dataset.trace().streams().len(),
                    segments: dataset.segments(),
                    time_range: dataset.time_range()?,
                    stats: dataset.stats()?,
                    unresolved_names: user_data.pending_name_count(),
                    waiting_correlations: user_data.correlation_count(),
                    snapshot_points: dataset.snapshot_points(),
                },
            )?;
        }
        Commands::Snapshot { at } => {
            let snapshot = dataset.snapshot(at)?;
            let report = report(&snapshot);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "t={} digest={} valloc={} palloc={} resources={} aliased={}",
                    report.timestamp,
                    report.digest,
                    report.virtual_allocations,
                    report.physical_allocations,
                    report.resources,
                    report.aliased_components
                );
                for totals in report.segments {
                    println!(
                        "  segment {} committed={} bound={} unbound={}",
                        totals.segment.0, totals.committed, totals.bound, totals.unbound
                    );
                }
            }
        }
        Commands::History { id, from, to } => {
            let range = match (from, to) {
                (None, None) => None,
                (from, to) => Some(from.unwrap_or(0)..=to.unwrap_or(u64::MAX)),
            };
            print(cli.json, &dataset.resource_history(id, range)?)?;
        }
        Commands::Aliasing { at, buckets } => match (at, buckets) {
            (_, Some(buckets)) => {
                print(cli.json, &dataset.aliasing_timeline(buckets, &CancelToken::new())?)?
            }
            (at, None) => {
                let at = at.map_or_else(|| dataset.time_range().map(|(_, end)| end), Ok)?;
                let snapshot = dataset.snapshot(at)?;
                let components: Vec<_> = snapshot.aliasing().aliased_components().collect();
                print(cli.json, &components)?;
            }
        },
        Commands::Allocations { at, min, max } => {
            #[derive(Debug, Serialize)]
            struct Sized<'a> {
                virtual_allocations: Vec<&'a rmtrace::state::VirtualAllocation>,
                physical_allocations: Vec<&'a rmtrace::state::PhysicalAllocation>,
            }
            let snapshot = dataset.snapshot(at)?;
            print(
                cli.json,
                &Sized {
                    virtual_allocations: snapshot
                        .virtual_allocations_sized(min, max)
                        .into_iter()
                        .map(|(_, allocation)| allocation)
                        .collect(),
                    physical_allocations: snapshot
                        .physical_allocations_sized(min, max)
                        .into_iter()
                        .map(|(_, allocation)| allocation)
                        .collect(),
                },
            )?;
        }
        Commands::Compare { base, diff } => {
            let base = dataset.snapshot(base)?;
            let diff = dataset.snapshot(diff)?;
            print(cli.json, &snapshot::compare(&base, &diff))?;
        }
        Commands::WriteSnapshot {
            at,
            name,
            output,
            container: into_container,
        } => {
            let snapshot = dataset.snapshot_named(&name, at, &CancelToken::new())?;
            if into_container {
                let ordinal = container::write(&output, dataset.trace(), &snapshot)?;
                println!("stored snapshot {ordinal} in {}", output.display());
            } else {
                legacy::write(&output, &snapshot)?;
                println!("wrote {}", output.display());
            }
        }
    }
    Ok(())
}
