//! Conformation datasets and task sources.

use std::fs;
use std::path::Path;

use confmeta_core::{MetaError, Result};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::molecule::ConformationExample;
use crate::task::Task;

// ============================================================================
// DATASET
// ============================================================================

/// Validated conformations loaded from a JSON array.
#[derive(Debug, Clone, Default)]
pub struct ConformationDataset {
    examples: Vec<ConformationExample>,
}

impl ConformationDataset {
    /// Load `[{atom_type, pos, bond_index, bond_type, smiles?}, ...]`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MetaError::dataset(format!("cannot read dataset {}: {}", path.display(), e))
        })?;
        let examples: Vec<ConformationExample> = serde_json::from_str(&content)
            .map_err(|e| MetaError::dataset(format!("{}: {}", path.display(), e)))?;
        let dataset = Self::from_examples(examples)?;
        info!("Loaded {} conformations from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    pub fn from_examples(examples: Vec<ConformationExample>) -> Result<Self> {
        for (i, ex) in examples.iter().enumerate() {
            ex.validate()
                .map_err(|e| MetaError::dataset(format!("example {}: {}", i, e)))?;
        }
        Ok(ConformationDataset { examples })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[ConformationExample] {
        &self.examples
    }

    pub fn into_examples(self) -> Vec<ConformationExample> {
        self.examples
    }
}

// ============================================================================
// TASK SOURCES
// ============================================================================

/// Unbounded supply of fixed-size tasks.
pub trait TaskSource {
    type Example;

    /// Next task; never runs dry.
    fn next_task(&mut self) -> Result<Task<Self::Example>>;

    /// Examples per task
    fn task_size(&self) -> usize;
}

/// Walks the dataset in consecutive chunks of `task_size` examples and starts over when it runs
/// out. A trailing partial chunk is never emitted.
#[derive(Debug, Clone)]
pub struct CyclicTaskSource<E> {
    examples: Vec<E>,
    task_size: usize,
    /// Chunk indices in the order of the current epoch
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    shuffle: Option<ChaCha8Rng>,
}

impl<E: Clone> CyclicTaskSource<E> {
    /// `shuffle_seed` reshuffles the chunk order at every epoch; `None` keeps file order.
    pub fn new(examples: Vec<E>, task_size: usize, shuffle_seed: Option<u64>) -> Result<Self> {
        if task_size == 0 {
            return Err(MetaError::config("task size must be greater than 0"));
        }
        let num_tasks = examples.len() / task_size;
        if num_tasks == 0 {
            return Err(MetaError::config(format!(
                "dataset of {} examples cannot fill a single task of {}",
                examples.len(),
                task_size
            )));
        }
        let dropped = examples.len() % task_size;
        if dropped > 0 {
            debug!("Dropping {} trailing examples that do not fill a task", dropped);
        }
        let mut source = CyclicTaskSource {
            examples,
            task_size,
            order: (0..num_tasks).collect(),
            cursor: 0,
            epoch: 0,
            shuffle: shuffle_seed.map(ChaCha8Rng::seed_from_u64),
        };
        source.reshuffle();
        Ok(source)
    }

    pub fn num_tasks(&self) -> usize {
        self.order.len()
    }

    /// Completed passes over the dataset
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn reshuffle(&mut self) {
        if let Some(rng) = self.shuffle.as_mut() {
            self.order.shuffle(rng);
        }
    }
}

impl<E: Clone> TaskSource for CyclicTaskSource<E> {
    type Example = E;

    fn next_task(&mut self) -> Result<Task<E>> {
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            self.reshuffle();
        }
        let chunk = self.order[self.cursor];
        self.cursor += 1;
        let start = chunk * self.task_size;
        Ok(Task::new(self.examples[start..start + self.task_size].to_vec()))
    }

    fn task_size(&self) -> usize {
        self.task_size
    }
}

/// Finite, unshuffled list of held-out tasks.
pub fn validation_tasks<E: Clone>(examples: &[E], task_size: usize) -> Result<Vec<Task<E>>> {
    if task_size == 0 {
        return Err(MetaError::config("task size must be greater than 0"));
    }
    let tasks: Vec<Task<E>> = examples
        .chunks_exact(task_size)
        .map(|chunk| Task::new(chunk.to_vec()))
        .collect();
    if tasks.is_empty() {
        return Err(MetaError::config(format!(
            "validation set of {} examples yields no task of {}",
            examples.len(),
            task_size
        )));
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::tests::water;

    #[test]
    fn test_cycles_and_drops_partial_chunk() {
        let mut source = CyclicTaskSource::new((0..7).collect::<Vec<_>>(), 3, None).unwrap();
        assert_eq!(source.num_tasks(), 2);
        assert_eq!(source.next_task().unwrap().examples(), &[0, 1, 2]);
        assert_eq!(source.next_task().unwrap().examples(), &[3, 4, 5]);
        assert_eq!(source.epoch(), 0);
        assert_eq!(source.next_task().unwrap().examples(), &[0, 1, 2]);
        assert_eq!(source.epoch(), 1);
    }

    #[test]
    fn test_too_small_dataset_is_config_error() {
        let err = CyclicTaskSource::new(vec![1, 2], 5, None).unwrap_err();
        assert!(err.is_config_error());
        assert!(validation_tasks(&[1, 2], 5).unwrap_err().is_config_error());
    }

    #[test]
    fn test_shuffled_order_keeps_tasks_intact_and_is_seeded() {
        let data: Vec<usize> = (0..40).collect();
        let mut a = CyclicTaskSource::new(data.clone(), 4, Some(9)).unwrap();
        let mut b = CyclicTaskSource::new(data, 4, Some(9)).unwrap();
        let mut seen = Vec::new();
        for _ in 0..10 {
            let ta = a.next_task().unwrap();
            assert_eq!(ta, b.next_task().unwrap());
            let ex = ta.examples();
            assert_eq!(ex[0] % 4, 0);
            assert!(ex.windows(2).all(|w| w[1] == w[0] + 1));
            seen.push(ex[0]);
        }
        seen.sort();
        assert_eq!(seen, (0..40).step_by(4).collect::<Vec<_>>());
    }

    #[test]
    fn test_load_json_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        let examples = vec![water(0.0), water(1.0)];
        std::fs::write(&path, serde_json::to_string(&examples).unwrap()).unwrap();
        let dataset = ConformationDataset::load(&path).unwrap();
        assert_eq!(dataset.examples(), examples.as_slice());

        std::fs::write(&path, r#"[{"atom_type": [6], "pos": []}]"#).unwrap();
        assert!(matches!(ConformationDataset::load(&path), Err(MetaError::Dataset(_))));
    }
}
