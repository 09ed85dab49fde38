//! Checkpoint persistence.
//!
//! One bincode file per validation cycle, `checkpoints/<iteration>.ckpt`, plus named files such
//! as `best.ckpt`. Files are written to a temporary file in the same directory, synced, then
//! renamed into place, so an interrupted write never leaves a truncated checkpoint behind.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use confmeta_autograd::{OptimizerState, ParamSet, SchedulerState};
use confmeta_core::{MetaError, OptimizerConfig, Result, TrainRunConfig};
use log::info;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Bumped whenever the record layout changes.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 2;

const CHECKPOINT_EXT: &str = "ckpt";

/// How optimizer and scheduler state was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerLayout {
    /// The single optimizer/scheduler pair that drives training
    Unified {
        optimizer: OptimizerState,
        scheduler: SchedulerState,
    },
    /// Separate global/local pairs from older runs. Only recognised so it can be rejected.
    Split {
        optimizer_global: OptimizerState,
        scheduler_global: SchedulerState,
        optimizer_local: OptimizerState,
        scheduler_local: SchedulerState,
    },
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    /// The run config as YAML
    pub config_yaml: String,
    pub params: ParamSet,
    pub layout: OptimizerLayout,
    pub iteration: u64,
    pub val_loss: f64,
}

impl CheckpointRecord {
    pub fn new(
        config: &TrainRunConfig,
        params: ParamSet,
        optimizer: OptimizerState,
        scheduler: SchedulerState,
        iteration: u64,
        val_loss: f64,
    ) -> Result<Self> {
        Ok(CheckpointRecord {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            config_yaml: config.to_yaml_string()?,
            params,
            layout: OptimizerLayout::Unified { optimizer, scheduler },
            iteration,
            val_loss,
        })
    }

    /// The config the record was written with
    pub fn config(&self) -> Result<TrainRunConfig> {
        TrainRunConfig::from_yaml_str(&self.config_yaml)
    }

    /// Optimizer and scheduler state of a unified record.
    pub fn unified_state(&self) -> Result<(&OptimizerState, &SchedulerState)> {
        match &self.layout {
            OptimizerLayout::Unified { optimizer, scheduler } => Ok((optimizer, scheduler)),
            OptimizerLayout::Split { .. } => Err(MetaError::schema(
                "checkpoint stores split global/local optimizers; only the unified layout can be resumed",
            )),
        }
    }

    /// Check that this record can be resumed by a run with `expected` parameters and
    /// `optimizer` settings.
    ///
    /// # Errors
    /// `MetaError::CheckpointSchema` on any version, layout, algorithm, name or shape mismatch.
    pub fn validate_against(&self, expected: &ParamSet, optimizer: &OptimizerConfig) -> Result<()> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(MetaError::schema(format!(
                "checkpoint schema version {} (expected {})",
                self.schema_version, CHECKPOINT_SCHEMA_VERSION
            )));
        }
        let (opt_state, _) = self.unified_state()?;
        if opt_state.algorithm != optimizer.name() {
            return Err(MetaError::schema(format!(
                "checkpoint optimizer is '{}', run uses '{}'",
                opt_state.algorithm,
                optimizer.name()
            )));
        }
        let expected_shapes = expected.shapes();
        if self.params.shapes() != expected_shapes {
            return Err(MetaError::schema(format!(
                "parameter names/shapes differ from the active model: {:?} vs {:?}",
                self.params.shapes(),
                expected_shapes
            )));
        }
        if opt_state.first_moment.shapes() != expected_shapes
            || opt_state.second_moment.shapes() != expected_shapes
        {
            return Err(MetaError::schema("optimizer moment buffers do not match the parameters"));
        }
        Ok(())
    }
}

/// Which checkpoint to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// Highest iteration number present
    Latest,
    Iteration(u64),
    /// A named file such as `best`
    Named(String),
}

impl FromStr for CheckpointSelector {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MetaError::config("empty checkpoint selector"));
        }
        if s.eq_ignore_ascii_case("latest") {
            return Ok(CheckpointSelector::Latest);
        }
        Ok(match s.parse::<u64>() {
            Ok(it) => CheckpointSelector::Iteration(it),
            Err(_) => CheckpointSelector::Named(s.to_string()),
        })
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointSelector::Latest => write!(f, "latest"),
            CheckpointSelector::Iteration(it) => write!(f, "{}", it),
            CheckpointSelector::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Reads and writes checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manager for `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(CheckpointManager { dir })
    }

    /// Manager for an existing directory; used when resuming.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(MetaError::checkpoint(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }
        Ok(CheckpointManager { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, selector: &CheckpointSelector) -> Result<PathBuf> {
        Ok(match selector {
            CheckpointSelector::Latest => {
                let latest = self.list_iterations()?.pop().ok_or_else(|| {
                    MetaError::checkpoint(format!("no checkpoints in {}", self.dir.display()))
                })?;
                self.file(&latest.to_string())
            }
            CheckpointSelector::Iteration(it) => self.file(&it.to_string()),
            CheckpointSelector::Named(name) => self.file(name),
        })
    }

    fn file(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stem, CHECKPOINT_EXT))
    }

    /// Save under `<iteration>.ckpt`.
    ///
    /// # Returns
    /// Path of the written file
    pub fn save(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        let path = self.file(&record.iteration.to_string());
        self.write_atomic(&path, record)?;
        info!("💾 Checkpoint saved: {}", path.display());
        Ok(path)
    }

    /// Save under `<name>.ckpt`, replacing any previous file of that name.
    pub fn save_named(&self, name: &str, record: &CheckpointRecord) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.parse::<u64>().is_ok() {
            return Err(MetaError::config(format!("invalid checkpoint name '{}'", name)));
        }
        let path = self.file(name);
        self.write_atomic(&path, record)?;
        info!("💾 Checkpoint saved: {}", path.display());
        Ok(path)
    }

    fn write_atomic(&self, path: &Path, record: &CheckpointRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| MetaError::Io(e.error))?;
        Ok(())
    }

    /// Iteration numbers present, ascending. Files with non-numeric stems are ignored.
    pub fn list_iterations(&self) -> Result<Vec<u64>> {
        let mut iterations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            if let Some(it) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                iterations.push(it);
            }
        }
        iterations.sort_unstable();
        Ok(iterations)
    }

    /// Load and decode a checkpoint.
    ///
    /// The leading schema version is read on its own first, so a record written with an older
    /// field layout is reported as incompatible rather than as undecodable.
    ///
    /// # Errors
    /// `MetaError::CheckpointSchema` when the file carries an older schema version.
    /// `MetaError::Checkpoint` when the file is missing or cannot be decoded. Compatibility with
    /// the active run is checked separately by [`CheckpointRecord::validate_against`].
    pub fn load(&self, selector: &CheckpointSelector) -> Result<CheckpointRecord> {
        let path = self.path_for(selector)?;
        let data = fs::read(&path).map_err(|e| {
            MetaError::checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;
        let version: u32 = bincode::deserialize(&data).map_err(|e| {
            MetaError::checkpoint(format!("cannot decode {}: {}", path.display(), e))
        })?;
        if (1..CHECKPOINT_SCHEMA_VERSION).contains(&version) {
            return Err(MetaError::schema(format!(
                "{} has schema version {} (expected {}); its layout cannot be resumed",
                path.display(),
                version,
                CHECKPOINT_SCHEMA_VERSION
            )));
        }
        if version != CHECKPOINT_SCHEMA_VERSION {
            return Err(MetaError::checkpoint(format!(
                "{} is not a checkpoint (header {:#x})",
                path.display(),
                version
            )));
        }
        let record: CheckpointRecord = bincode::deserialize(&data).map_err(|e| {
            MetaError::checkpoint(format!("cannot decode {}: {}", path.display(), e))
        })?;
        info!("Loaded checkpoint {} (iteration {})", path.display(), record.iteration);
        Ok(record)
    }
}
