//! Molecular conformations and collated batches.

use confmeta_core::{MetaError, Result};
use serde::{Deserialize, Serialize};

/// One conformation of one molecule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformationExample {
    #[serde(default)]
    pub smiles: Option<String>,
    /// Atom type per node (atomic number in the shipped datasets)
    pub atom_type: Vec<usize>,
    /// Cartesian coordinates in Å
    pub pos: Vec<[f64; 3]>,
    /// Covalent bonds as node-index pairs
    #[serde(default)]
    pub bond_index: Vec<[usize; 2]>,
    #[serde(default)]
    pub bond_type: Vec<usize>,
}

impl ConformationExample {
    pub fn num_nodes(&self) -> usize {
        self.atom_type.len()
    }

    pub fn num_bonds(&self) -> usize {
        self.bond_index.len()
    }

    /// Structural checks: node/position counts agree, bonds reference existing atoms.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_nodes();
        if n == 0 {
            return Err(MetaError::dataset("conformation has no atoms"));
        }
        if self.pos.len() != n {
            return Err(MetaError::dataset(format!(
                "{} atom types but {} positions",
                n,
                self.pos.len()
            )));
        }
        if self.bond_index.len() != self.bond_type.len() {
            return Err(MetaError::dataset(format!(
                "{} bonds but {} bond types",
                self.bond_index.len(),
                self.bond_type.len()
            )));
        }
        for &[i, j] in &self.bond_index {
            if i >= n || j >= n || i == j {
                return Err(MetaError::dataset(format!(
                    "bond ({}, {}) invalid for {} atoms",
                    i, j, n
                )));
            }
        }
        if self.pos.iter().flatten().any(|x| !x.is_finite()) {
            return Err(MetaError::dataset("non-finite coordinate"));
        }
        Ok(())
    }
}

/// Several conformations flattened into one disjoint graph.
///
/// Node indices in `bond_index` are global; `batch[node]` gives the graph a node belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct MolBatch {
    pub atom_type: Vec<usize>,
    pub pos: Vec<[f64; 3]>,
    pub bond_index: Vec<[usize; 2]>,
    pub bond_type: Vec<usize>,
    pub batch: Vec<usize>,
    pub num_nodes_per_graph: Vec<usize>,
    pub smiles: Vec<Option<String>>,
}

impl MolBatch {
    pub fn collate(examples: &[ConformationExample]) -> Result<Self> {
        let mut out = MolBatch {
            atom_type: Vec::new(),
            pos: Vec::new(),
            bond_index: Vec::new(),
            bond_type: Vec::new(),
            batch: Vec::new(),
            num_nodes_per_graph: Vec::with_capacity(examples.len()),
            smiles: Vec::with_capacity(examples.len()),
        };
        for (g, ex) in examples.iter().enumerate() {
            ex.validate()?;
            let offset = out.atom_type.len();
            out.atom_type.extend_from_slice(&ex.atom_type);
            out.pos.extend_from_slice(&ex.pos);
            out.bond_index
                .extend(ex.bond_index.iter().map(|&[i, j]| [i + offset, j + offset]));
            out.bond_type.extend_from_slice(&ex.bond_type);
            out.batch.extend(std::iter::repeat(g).take(ex.num_nodes()));
            out.num_nodes_per_graph.push(ex.num_nodes());
            out.smiles.push(ex.smiles.clone());
        }
        Ok(out)
    }

    pub fn num_graphs(&self) -> usize {
        self.num_nodes_per_graph.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.atom_type.len()
    }

    /// Offset of each graph's first node
    pub fn node_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.num_graphs());
        let mut acc = 0;
        for &n in &self.num_nodes_per_graph {
            offsets.push(acc);
            acc += n;
        }
        offsets
    }

    /// Undo `collate`.
    pub fn to_examples(&self) -> Vec<ConformationExample> {
        let offsets = self.node_offsets();
        let mut out: Vec<ConformationExample> = offsets
            .iter()
            .zip(&self.num_nodes_per_graph)
            .zip(&self.smiles)
            .map(|((&start, &n), smiles)| ConformationExample {
                smiles: smiles.clone(),
                atom_type: self.atom_type[start..start + n].to_vec(),
                pos: self.pos[start..start + n].to_vec(),
                bond_index: Vec::new(),
                bond_type: Vec::new(),
            })
            .collect();
        for (&[i, j], &t) in self.bond_index.iter().zip(&self.bond_type) {
            let g = self.batch[i];
            let start = offsets[g];
            out[g].bond_index.push([i - start, j - start]);
            out[g].bond_type.push(t);
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Water-like three-atom conformation, shifted along x
    pub(crate) fn water(shift: f64) -> ConformationExample {
        ConformationExample {
            smiles: Some("O".to_string()),
            atom_type: vec![8, 1, 1],
            pos: vec![[shift, 0.0, 0.0], [shift + 0.96, 0.0, 0.0], [shift - 0.24, 0.93, 0.0]],
            bond_index: vec![[0, 1], [0, 2]],
            bond_type: vec![1, 1],
        }
    }

    #[test]
    fn test_validate_rejects_dangling_bond() {
        let mut ex = water(0.0);
        ex.bond_index.push([0, 7]);
        ex.bond_type.push(1);
        assert!(matches!(ex.validate(), Err(MetaError::Dataset(_))));
    }

    #[test]
    fn test_collate_offsets_bonds() {
        let batch = MolBatch::collate(&[water(0.0), water(5.0)]).unwrap();
        assert_eq!(batch.num_graphs(), 2);
        assert_eq!(batch.num_nodes(), 6);
        assert_eq!(batch.batch, vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(batch.bond_index[2], [3, 4]);
    }

    #[test]
    fn test_to_examples_preserves_order() {
        let examples = vec![water(0.0), water(1.0), water(2.0)];
        let batch = MolBatch::collate(&examples).unwrap();
        assert_eq!(batch.to_examples(), examples);
    }
}
