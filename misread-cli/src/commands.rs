//! CLI subcommand handlers.

use crate::{Commands, JobsAction, StrategyArg};
use anyhow::Context;
use misread_core::data::{
    BalancingStrategy, DataAugmentationOptions, DataBalancingOptions, ImageFileCodec, balance,
    class_distribution, scan_directory,
};
use misread_core::eval::SelectionMetric;
use misread_core::jobs::{JobEvent, JobStore, JsonFileJobStore, StateLock};
use misread_core::training::{ExecutionMode, SearchStrategy, TrialSettings};
use misread_core::{
    CommandFitter, HyperparameterConfiguration, HyperparameterSpace, JobManager, JobRequest,
    JobStatus, MisreadConfig, TrainingJob, TrialExecutor, TuningRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: MisreadConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Scan { dir } => handle_scan(&dir, &config),
        Commands::Balance {
            dir,
            strategy,
            target,
            seed,
        } => handle_balance(&dir, strategy, target, seed, &config),
        Commands::Train {
            dir,
            output,
            learning_rate,
            epochs,
            batch_size,
            validation_split,
            balance,
            augment,
            name,
        } => {
            let configuration = HyperparameterConfiguration {
                validation_split_ratio: validation_split,
                data_balancing: balancing_options(balance, None, 42),
                data_augmentation: if augment {
                    DataAugmentationOptions::enabled()
                } else {
                    DataAugmentationOptions::default()
                },
                ..HyperparameterConfiguration::new(learning_rate, epochs, batch_size)
            };
            configuration.validate()?;
            let request = JobRequest::Train {
                training_dir: dir,
                output_dir: output,
                configuration,
            };
            run_job(name.unwrap_or_else(|| "train".into()), request, &config, workspace).await
        }
        Commands::Tune {
            dir,
            output,
            space,
            trials,
            seed,
            parallel,
            metric,
            no_early_stopping,
            name,
        } => {
            let space = load_space(&space)?;
            let selection_metric = match metric {
                Some(m) => m.parse::<SelectionMetric>().map_err(anyhow::Error::msg)?,
                None => config.tuning.selection_metric,
            };
            let request = TuningRequest {
                execution_mode: execution_mode(parallel, config.tuning.max_parallelism),
                selection_metric,
                early_stopping: config.tuning.early_stopping && !no_early_stopping,
                ..TuningRequest::new(dir, output, space)
            };
            let strategy = match trials {
                Some(number_of_trials) => SearchStrategy::Random {
                    number_of_trials,
                    seed,
                },
                None => SearchStrategy::Grid,
            };
            let request = JobRequest::Tune { request, strategy };
            run_job(name.unwrap_or_else(|| "tune".into()), request, &config, workspace).await
        }
        Commands::Jobs { action } => handle_jobs(action, &config, workspace).await,
    }
}

fn handle_scan(dir: &Path, config: &MisreadConfig) -> anyhow::Result<()> {
    let samples = scan_directory(dir, &config.data.image_extensions)?;
    let distribution = class_distribution(&samples);
    for (label, count) in &distribution {
        println!("{label:<24} {count:>8}");
    }
    println!("{:<24} {:>8}", "total", samples.len());
    Ok(())
}

fn handle_balance(
    dir: &Path,
    strategy: StrategyArg,
    target: Option<i64>,
    seed: u64,
    config: &MisreadConfig,
) -> anyhow::Result<()> {
    let samples = scan_directory(dir, &config.data.image_extensions)?;
    let balanced = balance(&samples, &balancing_options(strategy, target, seed));
    println!("{:<24} {:>8} {:>8}", "label", "before", "after");
    for (label, before) in &balanced.original_distribution {
        let after = balanced.distribution.get(label).copied().unwrap_or(0);
        println!("{label:<24} {before:>8} {after:>8}");
    }
    println!(
        "{:<24} {:>8} {:>8}",
        "total",
        samples.len(),
        balanced.samples.len()
    );
    Ok(())
}

async fn handle_jobs(
    action: JobsAction,
    config: &MisreadConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        JobsAction::List { status } => {
            let store = JsonFileJobStore::open(state_path(config, workspace)).await?;
            let jobs = match status {
                Some(s) => {
                    let status = s.parse::<JobStatus>().map_err(anyhow::Error::msg)?;
                    store.get_by_status(status).await?
                }
                None => store.list().await?,
            };
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in &jobs {
                print_summary(job);
            }
            Ok(())
        }
        JobsAction::Recover => {
            let (manager, _lock) = build_manager(config, workspace).await?;
            let recovered = manager.recover_interrupted().await?;
            println!("Recovered {} interrupted job(s).", recovered.len());
            for id in recovered {
                println!("  {id}");
            }
            Ok(())
        }
        JobsAction::Show { id } => {
            let store = JsonFileJobStore::open(state_path(config, workspace)).await?;
            let job = store
                .get_by_id(id)
                .await?
                .with_context(|| format!("Job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
    }
}

async fn run_job(
    name: String,
    request: JobRequest,
    config: &MisreadConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    // Holding the state lock means no other process is running these jobs.
    let (manager, _lock) = build_manager(config, workspace).await?;
    let recovered = manager.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "Marked interrupted jobs from a previous run as failed");
    }

    let mut events = manager.subscribe();
    let id = manager.enqueue(name, request).await?;
    println!("Job {id} queued");

    let progress = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                JobEvent::Progress {
                    job_id,
                    fraction,
                    message,
                } if job_id == id => {
                    info!(job_id = %job_id, percent = (fraction * 100.0).round(), "{message}");
                }
                JobEvent::StatusChanged { job_id, status } if job_id == id => {
                    if status.is_terminal() {
                        break;
                    }
                }
                _ => {}
            }
        }
    });

    let job = tokio::select! {
        job = manager.wait_for_completion(id) => job?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %id, "Interrupted, cancelling job");
            manager.cancel(id)?;
            manager.wait_for_completion(id).await?
        }
    };
    progress.abort();

    println!("{}", serde_json::to_string_pretty(job.as_ref())?);
    match job.status {
        JobStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "Job {id} {status}: {}",
            job.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Build a manager over the workspace's job state. The returned lock keeps
/// other processes off that state until it is dropped.
async fn build_manager(
    config: &MisreadConfig,
    workspace: &Path,
) -> anyhow::Result<(Arc<JobManager>, StateLock)> {
    let state = state_path(config, workspace);
    let lock = StateLock::acquire(&state)?;
    let store = JsonFileJobStore::open(&state).await?;
    let fitter = CommandFitter::from_config(&config.fitter, fitter_workdir(config, workspace)?);
    let executor = TrialExecutor::new(Arc::new(fitter), Arc::new(ImageFileCodec)).with_settings(
        TrialSettings {
            image_extensions: config.data.image_extensions.clone(),
            evaluate_augmentation_impact: config.tuning.evaluate_augmentation_impact,
        },
    );
    let manager = JobManager::new(
        Arc::new(executor),
        Arc::new(store),
        config.jobs.max_concurrent_jobs,
    )?;
    Ok((Arc::new(manager), lock))
}

fn fitter_workdir(config: &MisreadConfig, workspace: &Path) -> anyhow::Result<PathBuf> {
    let dir = config.data.resolve_workspace_dir(workspace);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create work directory {}", dir.display()))?;
    Ok(dir)
}

fn print_summary(job: &TrainingJob) {
    println!(
        "{}  {:<10} {:<6} {:>4.0}%  {}  {}",
        job.id,
        job.status.to_string(),
        job.request.kind(),
        job.progress * 100.0,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        job.name
    );
    if let Some(error) = &job.error {
        println!("    error: {error}");
    }
}

fn balancing_options(strategy: StrategyArg, target: Option<i64>, seed: u64) -> DataBalancingOptions {
    DataBalancingOptions {
        strategy: match strategy {
            StrategyArg::None => BalancingStrategy::None,
            StrategyArg::Over => BalancingStrategy::OverSample,
            StrategyArg::Under => BalancingStrategy::UnderSample,
        },
        target_sample_count_per_class: target,
        random_seed: seed,
        ..DataBalancingOptions::default()
    }
}

/// `--parallel 0` means "use every processor"; without the flag the config
/// default applies.
fn execution_mode(cli: Option<usize>, configured: Option<usize>) -> ExecutionMode {
    match cli.or(configured) {
        Some(0) => ExecutionMode::Parallel {
            max_degree_of_parallelism: None,
        },
        Some(n) => ExecutionMode::Parallel {
            max_degree_of_parallelism: Some(n),
        },
        None => ExecutionMode::Sequential,
    }
}

fn state_path(config: &MisreadConfig, workspace: &Path) -> PathBuf {
    match &config.jobs.state_file {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => workspace.join(path),
        None => workspace.join(".misread").join("jobs.json"),
    }
}

fn load_space(path: &Path) -> anyhow::Result<HyperparameterSpace> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read search space {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let space = if is_json {
        serde_json::from_str(&text)?
    } else {
        toml::from_str(&text)?
    };
    Ok(space)
}
