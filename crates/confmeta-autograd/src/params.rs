//! Named parameter sets.
//!
//! `ParamSet` owns concrete tensors (meta-parameters, gradients, moment buffers).
//! `ParamVars` is the same name space mapped onto tape handles, which is how
//! adapted parameters exist: a functional update produces a new `ParamVars`
//! while the `ParamSet` it was registered from stays untouched.

use std::collections::BTreeMap;

use confmeta_core::{MetaError, Result};
use serde::{Deserialize, Serialize};

use crate::tape::{Tape, VarId};
use crate::tensor::Tensor;

/// Ordered `name -> tensor` map
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.tensors.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| MetaError::autograd(format!("unknown parameter '{}'", name)))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(name)
            .ok_or_else(|| MetaError::autograd(format!("unknown parameter '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Tensor)> {
        self.tensors.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(Tensor::numel).sum()
    }

    /// `name -> shape`, used to check checkpoints against the active model
    pub fn shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.tensors.iter().map(|(k, v)| (k.clone(), v.shape.clone())).collect()
    }

    /// Same names and shapes, all zeros
    pub fn zeros_like(&self) -> ParamSet {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), Tensor::zeros(&v.shape)))
            .collect();
        ParamSet { tensors }
    }

    /// Fails unless `other` has exactly the same names and shapes.
    pub fn check_same_layout(&self, other: &ParamSet) -> Result<()> {
        if self.shapes() != other.shapes() {
            return Err(MetaError::autograd(format!(
                "parameter layout differs: {:?} vs {:?}",
                self.shapes(),
                other.shapes()
            )));
        }
        Ok(())
    }

    /// `self += other`, element-wise
    pub fn accumulate(&mut self, other: &ParamSet) -> Result<()> {
        self.check_same_layout(other)?;
        for (name, acc) in self.tensors.iter_mut() {
            let src = &other.tensors[name];
            for (a, b) in acc.data.iter_mut().zip(&src.data) {
                *a += b;
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        for t in self.tensors.values_mut() {
            for x in t.data.iter_mut() {
                *x *= factor;
            }
        }
    }

    /// L2 norm over every element of every tensor
    pub fn global_norm(&self) -> f64 {
        self.tensors.values().map(Tensor::sum_sq).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.values().all(Tensor::is_finite)
    }

    /// Put every tensor on `tape` as a gradient-tracking leaf.
    pub fn register(&self, tape: &mut Tape) -> ParamVars {
        let vars = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), tape.param(v.clone())))
            .collect();
        ParamVars { vars }
    }

    /// Put every tensor on `tape` as a constant.
    pub fn register_constant(&self, tape: &mut Tape) -> ParamVars {
        let vars = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), tape.constant(v.clone())))
            .collect();
        ParamVars { vars }
    }
}

/// `name -> tape handle` view of a parameter set
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamVars {
    vars: BTreeMap<String, VarId>,
}

impl ParamVars {
    pub fn get(&self, name: &str) -> Result<VarId> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| MetaError::autograd(format!("unknown parameter '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarId)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Handles in name order
    pub fn ids(&self) -> Vec<VarId> {
        self.vars.values().copied().collect()
    }

    /// Rebuild a view from handles given in name order.
    pub fn with_ids(&self, ids: &[VarId]) -> Result<ParamVars> {
        if ids.len() != self.vars.len() {
            return Err(MetaError::autograd(format!(
                "expected {} handles, got {}",
                self.vars.len(),
                ids.len()
            )));
        }
        let vars = self.vars.keys().cloned().zip(ids.iter().copied()).collect();
        Ok(ParamVars { vars })
    }

    /// Read the current values back off the tape.
    pub fn values(&self, tape: &Tape) -> Result<ParamSet> {
        let mut out = ParamSet::new();
        for (name, &id) in &self.vars {
            out.insert(name.clone(), tape.value(id)?.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("w", Tensor::vector(vec![3.0, 4.0]));
        p.insert("b", Tensor::scalar(0.0));
        p
    }

    #[test]
    fn test_global_norm_and_scale() {
        let mut p = sample();
        assert_eq!(p.global_norm(), 5.0);
        p.scale(0.5);
        assert_eq!(p.get("w").unwrap().data, vec![1.5, 2.0]);
    }

    #[test]
    fn test_accumulate_requires_same_layout() {
        let mut acc = sample().zeros_like();
        acc.accumulate(&sample()).unwrap();
        acc.accumulate(&sample()).unwrap();
        assert_eq!(acc.get("w").unwrap().data, vec![6.0, 8.0]);

        let mut other = ParamSet::new();
        other.insert("w", Tensor::vector(vec![1.0]));
        assert!(acc.accumulate(&other).is_err());
    }

    #[test]
    fn test_register_and_read_back() {
        let p = sample();
        let mut tape = Tape::new();
        let vars = p.register(&mut tape);
        assert_eq!(vars.len(), 2);
        assert!(tape.requires_grad(vars.get("w").unwrap()));
        assert_eq!(vars.values(&tape).unwrap(), p);
        assert!(vars.get("missing").is_err());

        let renamed = vars.with_ids(&vars.ids()).unwrap();
        assert_eq!(renamed, vars);
        assert!(vars.with_ids(&[0]).is_err());
    }
}
