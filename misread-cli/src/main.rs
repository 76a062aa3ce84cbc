//! misread CLI: scan datasets, preview balancing, and run training or
//! hyperparameter-search jobs against an external fitter.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// misread: training orchestration for barcode read-failure classifiers
#[derive(Parser, Debug)]
#[command(name = "misread", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show the class distribution of a training directory
    Scan {
        /// Directory with one subdirectory per label
        dir: PathBuf,
    },
    /// Preview the class distribution after balancing
    Balance {
        dir: PathBuf,
        #[arg(long, value_enum, default_value = "over")]
        strategy: StrategyArg,
        /// Explicit per-class target
        #[arg(long)]
        target: Option<i64>,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Train a single configuration
    Train {
        dir: PathBuf,
        /// Output directory for model artifacts
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "0.01")]
        learning_rate: f64,
        #[arg(long, default_value = "20")]
        epochs: u32,
        #[arg(long, default_value = "32")]
        batch_size: u32,
        #[arg(long)]
        validation_split: Option<f64>,
        #[arg(long, value_enum, default_value = "none")]
        balance: StrategyArg,
        /// Enable augmentation with default operation probabilities
        #[arg(long)]
        augment: bool,
        /// Job name
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a hyperparameter search
    Tune {
        dir: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Search space file (TOML or JSON)
        #[arg(short, long)]
        space: PathBuf,
        /// Random search with this many trials (grid search when omitted)
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Run trials in parallel with this degree (0 = processor count)
        #[arg(long)]
        parallel: Option<usize>,
        /// accuracy, macro_f1, micro_f1 or log_loss
        #[arg(long)]
        metric: Option<String>,
        #[arg(long)]
        no_early_stopping: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Inspect persisted jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum JobsAction {
    /// List all jobs
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Mark jobs interrupted by a crash as failed
    Recover,
    /// Show one job as JSON
    Show { id: uuid::Uuid },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StrategyArg {
    None,
    Over,
    Under,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "misread", "misread")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "misread.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = misread_core::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    commands::handle_command(cli.command, config, &workspace).await
}
