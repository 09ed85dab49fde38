//! Scalar metric stream, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use confmeta_core::Result;
use serde::{Deserialize, Serialize};

/// One logged scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: u64,
    pub value: f64,
    /// RFC 3339 local time
    pub wall_time: String,
}

/// Appends `ScalarRecord`s to a `.jsonl` file, flushing after every record.
#[derive(Debug)]
pub struct MetricsWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl MetricsWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(MetricsWriter { path, out: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
            wall_time: Local::now().to_rfc3339(),
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Read every record back from a metrics file.
pub fn read_scalars<P: AsRef<Path>>(path: P) -> Result<Vec<ScalarRecord>> {
    let content = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
