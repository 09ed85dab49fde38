//! Tasks and the positional support/query split.

use confmeta_core::{MetaError, Result};

use crate::molecule::{ConformationExample, MolBatch};

/// A fixed-size group of examples adapted on as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<E> {
    examples: Vec<E>,
}

/// Borrowed halves of a task: the first `k - 1` examples and the last one.
#[derive(Debug)]
pub struct TaskSplit<'a, E> {
    pub support: &'a [E],
    pub query: &'a [E],
}

impl<E> Task<E> {
    pub fn new(examples: Vec<E>) -> Self {
        Task { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[E] {
        &self.examples
    }

    pub fn into_examples(self) -> Vec<E> {
        self.examples
    }

    /// Support = all but the last example, query = the last example.
    ///
    /// Order is never changed. Tasks with fewer than two examples have no query and are a
    /// configuration error.
    pub fn split(&self) -> Result<TaskSplit<'_, E>> {
        if self.examples.len() < 2 {
            return Err(MetaError::config(format!(
                "task of {} example(s) cannot be split; the query split would be empty",
                self.examples.len()
            )));
        }
        let (support, query) = self.examples.split_at(self.examples.len() - 1);
        Ok(TaskSplit { support, query })
    }
}

impl Task<ConformationExample> {
    /// Task from a collated batch, one example per graph in batch order.
    pub fn from_batch(batch: &MolBatch) -> Self {
        Task::new(batch.to_examples())
    }
}
