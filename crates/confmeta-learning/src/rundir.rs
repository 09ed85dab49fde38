//! Run directories: `<logdir>/<config-name>_<timestamp>[_resume]/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use confmeta_core::{MetaError, Result};
use log::info;

const TIMESTAMP_FORMAT: &str = "%Y_%m_%d__%H_%M_%S";

/// Layout of one training run on disk.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Fresh run: config snapshot plus a `models/` copy of the model source.
    pub fn create_new(logdir: &Path, config_path: &Path, sources: &[(&str, &str)]) -> Result<Self> {
        let run = Self::create(logdir, &config_name(config_path), None)?;
        let models = run.root.join("models");
        fs::create_dir_all(&models)?;
        for (name, contents) in sources {
            fs::write(models.join(name), contents)?;
        }
        run.snapshot_config(config_path)?;
        Ok(run)
    }

    /// Resumed run: config snapshot plus a link back to the run being resumed.
    pub fn create_resume(logdir: &Path, config_path: &Path, resumed_from: &Path) -> Result<Self> {
        let run = Self::create(logdir, &config_name(config_path), Some("resume"))?;
        let target = fs::canonicalize(resumed_from)?;
        let link_name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "resumed_run".into());
        link_previous_run(&target, &run.root.join(link_name))?;
        run.snapshot_config(config_path)?;
        Ok(run)
    }

    /// New uniquely named directory with an empty `checkpoints/`.
    pub fn create(logdir: &Path, prefix: &str, tag: Option<&str>) -> Result<Self> {
        fs::create_dir_all(logdir)?;
        let mut name = format!("{}_{}", prefix, Local::now().format(TIMESTAMP_FORMAT));
        if let Some(tag) = tag {
            name.push('_');
            name.push_str(tag);
        }

        let mut root = logdir.join(&name);
        let mut attempt = 1;
        loop {
            match fs::create_dir(&root) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    root = logdir.join(format!("{}_{}", name, attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let run = RunDirectory { root };
        fs::create_dir_all(run.checkpoint_dir())?;
        info!("Run directory: {}", run.root.display());
        Ok(run)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("metrics.jsonl")
    }

    fn snapshot_config(&self, config_path: &Path) -> Result<()> {
        let file_name = config_path
            .file_name()
            .ok_or_else(|| MetaError::config(format!("{} is not a file", config_path.display())))?;
        fs::copy(config_path, self.root.join(file_name))?;
        Ok(())
    }
}

#[cfg(unix)]
fn link_previous_run(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_previous_run(target: &Path, link: &Path) -> Result<()> {
    fs::write(link.with_extension("txt"), target.display().to_string())?;
    Ok(())
}

/// Config name used as the run prefix: file name without extension.
pub fn config_name(config_path: &Path) -> String {
    config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string())
}

/// The YAML config snapshot inside an existing run directory.
pub fn find_config(run_dir: &Path) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(run_dir)
        .map_err(|e| MetaError::config(format!("cannot read {}: {}", run_dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file() && matches!(p.extension().and_then(|e| e.to_str()), Some("yml") | Some("yaml"))
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| MetaError::config(format!("no *.yml config in {}", run_dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let config = tmp.path().join("qm9_maml.yml");
        fs::write(&config, "train: {}\n").unwrap();

        let run = RunDirectory::create_new(&tmp.path().join("logs"), &config, &[("model.rs", "// src")]).unwrap();
        let name = run.root().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("qm9_maml_"));
        assert!(run.checkpoint_dir().is_dir());
        assert!(run.root().join("qm9_maml.yml").is_file());
        assert_eq!(fs::read_to_string(run.root().join("models/model.rs")).unwrap(), "// src");
        assert_eq!(find_config(run.root()).unwrap(), run.root().join("qm9_maml.yml"));
    }

    #[test]
    fn test_same_second_runs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let a = RunDirectory::create(tmp.path(), "x", None).unwrap();
        let b = RunDirectory::create(tmp.path(), "x", None).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[cfg(unix)]
    #[test]
    fn test_resume_links_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");
        let config = tmp.path().join("drugs.yml");
        fs::write(&config, "train: {}\n").unwrap();
        let first = RunDirectory::create_new(&logs, &config, &[]).unwrap();

        let resumed = RunDirectory::create_resume(&logs, &config, first.root()).unwrap();
        let name = resumed.root().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_resume"));
        let link = resumed.root().join(first.root().file_name().unwrap());
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_find_config_without_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_config(tmp.path()).unwrap_err().is_config_error());
    }
}
