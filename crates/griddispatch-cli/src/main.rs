//! griddispatch - dependency-aware grid job dispatcher
//!
//! Submits hierarchy-shaped work to a `qsub`-style scheduler so that every
//! job waits on the jobs below it, and runs batch members on the compute
//! node when the scheduler starts a job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use griddispatch_core::config::DispatchConfig;
use griddispatch_core::dispatch::{DispatchReport, Dispatcher};
use griddispatch_core::fanout;
use griddispatch_core::submit::{DryRunSubmitter, QsubSubmitter, Submitter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// griddispatch - dependency-aware grid job dispatcher
#[derive(Parser, Debug)]
#[command(name = "griddispatch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a filter directive
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log scheduler command lines instead of submitting
    #[arg(long, global = true)]
    dry_run: bool,

    /// Override `walk.batch_size`
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Override `walk.fanout`
    #[arg(long, global = true)]
    fanout: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit `<task> <dir>` for every directory under a root, children first
    Tree {
        /// Task command line; split on whitespace
        task: String,

        /// Root of the directory tree
        root: PathBuf,
    },

    /// Submit `<task> <dir>` for every leaf directory under a root, without holds
    Leaves {
        /// Task command line; split on whitespace
        task: String,

        /// Root of the directory tree
        root: PathBuf,
    },

    /// Probe a target program for addresses and submit them in batches
    Addresses {
        /// Target command line
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run one batch on the compute node (invoked by the scheduler)
    Worker {
        /// Flag carrying each member's slot index
        #[arg(long, allow_hyphen_values = true)]
        index_flag: Option<String>,

        /// Flag carrying each member's id
        #[arg(long, allow_hyphen_values = true)]
        target_flag: Option<String>,

        /// Program run after each member to log the host name
        #[arg(long, conflicts_with = "no_host_probe")]
        host_probe: Option<String>,

        /// Skip the host name step
        #[arg(long)]
        no_host_probe: bool,

        /// Comma-separated member ids
        members: String,

        /// Target command template
        #[arg(last = true, required = true)]
        template: Vec<String>,
    },
}

/// Parse arguments. Bad arguments print usage and exit with status 0.
fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                std::process::exit(0);
            },
        },
    }
}

fn load_config(cli: &Cli) -> Result<DispatchConfig> {
    let mut config = match &cli.config {
        Some(path) => DispatchConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DispatchConfig::default(),
    };
    if let Some(batch_size) = cli.batch_size {
        config.walk.batch_size = batch_size;
    }
    if let Some(fanout) = cli.fanout {
        config.walk.fanout = fanout;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_dispatcher(config: &DispatchConfig, dry_run: bool) -> Result<Dispatcher> {
    let submitter: Arc<dyn Submitter> = if dry_run {
        Arc::new(DryRunSubmitter::new(config.scheduler.clone()))
    } else {
        Arc::new(QsubSubmitter::new(config.scheduler.clone()))
    };
    Dispatcher::new(config, submitter).context("failed to set up dispatcher")
}

fn finish(report: &DispatchReport) -> Result<()> {
    print!("{report}");
    for failed in &report.failed {
        error!(members = ?failed.members, "{}", failed.error);
    }
    if !report.is_complete() {
        bail!(
            "{} batches failed and {} were skipped",
            report.failed.len(),
            report.skipped.len()
        );
    }
    Ok(())
}

async fn run_tree(config: &DispatchConfig, dry_run: bool, task: &str, root: &Path) -> Result<()> {
    let task: Vec<String> = task.split_whitespace().map(str::to_string).collect();
    let dispatcher = build_dispatcher(config, dry_run)?;
    let report = dispatcher
        .dispatch_tree(&task, root)
        .await
        .with_context(|| format!("directory dispatch of {} failed", root.display()))?;
    dispatcher.shutdown();
    finish(&report)
}

async fn run_leaves(config: &DispatchConfig, dry_run: bool, task: &str, root: &Path) -> Result<()> {
    let task: Vec<String> = task.split_whitespace().map(str::to_string).collect();
    let dispatcher = build_dispatcher(config, dry_run)?;
    let report = dispatcher
        .dispatch_leaves(&task, root)
        .await
        .with_context(|| format!("leaf dispatch of {} failed", root.display()))?;
    dispatcher.shutdown();
    finish(&report)
}

async fn run_addresses(config: &DispatchConfig, dry_run: bool, command: &[String]) -> Result<()> {
    let dispatcher = build_dispatcher(config, dry_run)?;
    let report = dispatcher
        .probe_and_dispatch(command)
        .await
        .context("address dispatch failed")?;
    dispatcher.shutdown();
    finish(&report)
}

fn main() -> Result<()> {
    let cli = parse_args();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = load_config(&cli)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Commands::Tree { task, root } => rt.block_on(run_tree(&config, cli.dry_run, &task, &root)),
        Commands::Leaves { task, root } => {
            rt.block_on(run_leaves(&config, cli.dry_run, &task, &root))
        },
        Commands::Addresses { command } => {
            rt.block_on(run_addresses(&config, cli.dry_run, &command))
        },
        Commands::Worker {
            index_flag,
            target_flag,
            host_probe,
            no_host_probe,
            members,
            template,
        } => {
            if let Some(flag) = index_flag {
                config.worker.index_flag = flag;
            }
            if let Some(flag) = target_flag {
                config.worker.target_flag = flag;
            }
            if let Some(probe) = host_probe {
                config.worker.host_probe = probe;
            }
            if no_host_probe {
                config.worker.host_probe.clear();
            }

            let members: Vec<String> = members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            let outcome = rt
                .block_on(fanout::run_batch(&members, &template, &config.worker))
                .context("worker batch could not start")?;

            let failed = outcome.failures().count();
            if failed > 0 {
                error!(failed, members = outcome.members.len(), "batch had failing members");
                std::process::exit(1);
            }
            info!(members = outcome.members.len(), "batch succeeded");
            Ok(())
        },
    }
}
