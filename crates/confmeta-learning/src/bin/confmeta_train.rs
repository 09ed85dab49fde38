//! confmeta training binary
//!
//! Meta-trains a conformation denoiser from a YAML config, or resumes a previous run when given
//! its run directory.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use confmeta_core::TrainRunConfig;
use confmeta_learning::rundir::find_config;
use confmeta_learning::{
    get_model, validation_tasks, AdaptableModel, CheckpointManager, CheckpointSelector, ConformationDataset,
    CyclicTaskSource, MetricsWriter, RunDirectory, RunOutcome, TrainingSupervisor,
};
use log::{info, warn};

/// Command line arguments for meta-training
#[derive(Parser, Debug)]
#[command(name = "confmeta-train")]
#[command(about = "MAML meta-training for molecular conformation denoisers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// YAML config file, or the directory of a previous run to resume
    config: PathBuf,

    /// Compute device (only `cpu` is available)
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Checkpoint to resume from: an iteration number, a name such as `best`, or `latest`
    #[arg(long = "resume_iter")]
    resume_iter: Option<String>,

    /// Parent directory for run directories
    #[arg(long, default_value = "./logs")]
    logdir: PathBuf,

    /// Meta-learning (true) or plain mini-batch training (false)
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    maml: bool,

    /// Restart the iteration counter at 1 when resuming (fine-tuning)
    #[arg(long = "reset_iter")]
    reset_iter: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    validate_inputs(&args)?;
    info!("{:?}", args);

    // ── Config ───────────────────────────────────────────────────────
    let resume_from = args.config.is_dir().then(|| args.config.clone());
    let config_path = match &resume_from {
        Some(dir) => find_config(dir).with_context(|| format!("No config in {}", dir.display()))?,
        None => args.config.clone(),
    };
    let mut config = TrainRunConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if !args.maml {
        config.train.maml.enabled = false;
    }
    info!("{:?}", config);

    // ── Run directory ────────────────────────────────────────────────
    let model = Rc::new(get_model(&config.model).context("Failed to build model")?);
    let run = match &resume_from {
        Some(dir) => RunDirectory::create_resume(&args.logdir, &config_path, dir),
        None => RunDirectory::create_new(&args.logdir, &config_path, &model.source_files()),
    }
    .context("Failed to create run directory")?;
    let metrics = MetricsWriter::create(run.metrics_path()).context("Failed to open metrics file")?;

    // ── Data ─────────────────────────────────────────────────────────
    info!("Loading datasets...");
    let k = config.train.maml.num_examples_per_task;
    let train_set = ConformationDataset::load(&config.dataset.train)
        .with_context(|| format!("Failed to load {}", config.dataset.train.display()))?;
    let val_set = ConformationDataset::load(&config.dataset.val)
        .with_context(|| format!("Failed to load {}", config.dataset.val.display()))?;
    let shuffle_seed = config.train.maml.shuffle_tasks.then_some(config.train.seed);
    let train_source = CyclicTaskSource::new(train_set.into_examples(), k, shuffle_seed)
        .context("Training set is too small")?;
    let val_tasks = validation_tasks(val_set.examples(), k).context("Validation set is too small")?;
    info!(
        "{} training tasks, {} validation tasks of {} examples",
        train_source.num_tasks(),
        val_tasks.len(),
        k
    );

    // ── Supervisor ───────────────────────────────────────────────────
    let checkpoints = CheckpointManager::new(run.checkpoint_dir())?;
    let supervisor = match &resume_from {
        Some(dir) => {
            let selector = match args.resume_iter.as_deref() {
                Some(s) => s.parse::<CheckpointSelector>()?,
                None => CheckpointSelector::Latest,
            };
            let previous = CheckpointManager::open(dir.join("checkpoints"))?;
            info!("Resuming from: {}", previous.path_for(&selector)?.display());
            let record = previous
                .load(&selector)
                .with_context(|| format!("Failed to load checkpoint '{}'", selector))?;
            TrainingSupervisor::resume(
                config,
                model,
                record,
                args.reset_iter,
                train_source,
                val_tasks,
                checkpoints,
            )
            .map_err(|e| anyhow::anyhow!(e.user_message()))?
        }
        None => TrainingSupervisor::new(config, model, train_source, val_tasks, checkpoints)?,
    };
    let mut supervisor = supervisor.with_metrics(metrics).with_progress(true);

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    match supervisor.run(&interrupt)? {
        RunOutcome::Completed { last_iter } => {
            info!("✅ Completed {} iterations; run saved to {}", last_iter, run.root().display());
        }
        RunOutcome::Interrupted { last_iter } => {
            warn!("Interrupted after iteration {}; run saved to {}", last_iter, run.root().display());
        }
    }
    Ok(())
}

fn validate_inputs(args: &Args) -> Result<()> {
    if !args.config.exists() {
        bail!("Config path does not exist: {}", args.config.display());
    }
    if args.resume_iter.is_some() && !args.config.is_dir() {
        bail!("--resume_iter needs a run directory, got {}", args.config.display());
    }
    if args.reset_iter && !args.config.is_dir() {
        bail!("--reset_iter only applies when resuming a run directory");
    }
    if args.device != "cpu" {
        warn!("Only the CPU backend is available; ignoring --device {}", args.device);
    }
    Ok(())
}
