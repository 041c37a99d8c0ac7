use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};

use phasepool::bench::{BenchCase, Manifest, ResultsFile, StepDefaults};
use phasepool::config::Config;
use phasepool::orchestration::Scheduler;
use phasepool::{plog_debug, plog_warn, Error, Result};

/// phasepool - run benchmark manifests on a fixed pool of workers
#[derive(Parser, Debug)]
#[command(name = "phasepool")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PHASEPOOL_DEBUG=1     Enable debug logging (alternative to -vv)")]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: ~/.phasepool/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every case of a manifest, appending results as they arrive
    Run {
        /// Manifest file with [[case]] tables
        manifest: PathBuf,

        /// Number of workers (default: config `jobs`, else all cores)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// JSON-lines results file; cases already in it are skipped
        #[arg(short = 'o', long, default_value = "results.jsonl")]
        output: PathBuf,

        /// Only run cases whose name contains this string
        #[arg(long)]
        only: Option<String>,
    },

    /// List the cases of a manifest
    List {
        /// Manifest file with [[case]] tables
        manifest: PathBuf,
    },
}

/// Counts reported at the end of a run.
#[derive(Debug, Default)]
struct RunSummary {
    received: usize,
    failed: usize,
    interrupted: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    phasepool::log::init(cli.verbose, config.effective_log_file());

    match cli.command {
        Command::List { manifest } => run_list(&manifest),
        Command::Run {
            manifest,
            jobs,
            output,
            only,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_manifest(config, &manifest, jobs, output, only))
        }
    }
}

fn run_list(path: &Path) -> Result<()> {
    let manifest = Manifest::load(path)?;
    for name in manifest.names() {
        println!("{}", name);
    }
    Ok(())
}

async fn run_manifest(
    config: Config,
    path: &Path,
    jobs: Option<usize>,
    output: PathBuf,
    only: Option<String>,
) -> Result<()> {
    let manifest = Manifest::load(path)?;
    let results = ResultsFile::new(output);
    let done = results.load_completed().await?;
    let defaults = StepDefaults::from_config(&config);
    let manifest_needs_monitor = manifest.needs_monitor(&defaults);

    let mut skipped = 0;
    let cases: Vec<BenchCase> = manifest
        .cases
        .into_iter()
        .filter(|case| only.as_deref().map_or(true, |s| case.name.contains(s)))
        .filter(|case| {
            let fresh = !done.contains(&case.name);
            if !fresh {
                plog_debug!("Skipping {}: already in {}", case.name, results.path().display());
                skipped += 1;
            }
            fresh
        })
        .map(|case| BenchCase::new(case, defaults))
        .collect();

    let total = cases.len();
    let jobs = jobs.unwrap_or_else(|| config.effective_jobs());
    println!(
        "Running {} case(s) on {} worker(s), {} already done",
        total, jobs, skipped
    );
    if total == 0 {
        return Ok(());
    }

    let env = config.worker_env();
    if manifest_needs_monitor {
        env.executor.verify_monitor().await?;
    }
    let mut scheduler = Scheduler::with_env(jobs, env)?;
    scheduler.submit(cases);

    let outcome = consume(&mut scheduler, &results, total).await;
    scheduler.shutdown().await;
    let summary = outcome?;

    println!(
        "Finished {}/{} case(s), {} with failures; results in {}",
        summary.received,
        total,
        summary.failed,
        results.path().display()
    );
    if summary.interrupted {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Write each resolved case as it arrives until the scheduler runs dry
/// or the user interrupts.
async fn consume(scheduler: &mut Scheduler, results: &ResultsFile, total: usize) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            next = scheduler.next() => {
                let Some(resolved) = next else {
                    break;
                };
                let report = BenchCase::report_for(resolved);
                results.append(&report).await?;
                summary.received += 1;
                if !report.is_ok() {
                    summary.failed += 1;
                }
                println!("[{}/{}] {}", summary.received, total, report.summary());
            }
            _ = &mut ctrl_c => {
                plog_warn!(
                    "Interrupted: discarding {} unfinished case(s)",
                    total - summary.received
                );
                summary.interrupted = true;
                break;
            }
        }
    }
    Ok(summary)
}
