//! Dense row-major `f64` tensors.
//!
//! Deliberately minimal: the tape only needs flat storage, a shape, and a handful of kernels
//! (matmul, transpose, row gather/scatter). Scalars have an empty shape.

use confmeta_core::{MetaError, Result};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Flat `f64` tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(MetaError::autograd(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor { shape: shape.to_vec(), data: vec![0.0; n] }
    }

    pub fn filled(shape: &[usize], value: f64) -> Self {
        let n: usize = shape.iter().product();
        Tensor { shape: shape.to_vec(), data: vec![value; n] }
    }

    pub fn scalar(value: f64) -> Self {
        Tensor { shape: Vec::new(), data: vec![value] }
    }

    /// 1-D tensor
    pub fn vector(data: Vec<f64>) -> Self {
        Tensor { shape: vec![data.len()], data }
    }

    /// 2-D tensor from row-major data
    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        Tensor::new(data, vec![rows, cols])
    }

    /// Gaussian initialisation `N(0, std^2)`
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], std: f64, rng: &mut R) -> Self {
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|_| {
                let z: f64 = StandardNormal.sample(rng);
                z * std
            })
            .collect();
        Tensor { shape: shape.to_vec(), data }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    /// Value of a single-element tensor
    pub fn item(&self) -> Result<f64> {
        if self.data.len() != 1 {
            return Err(MetaError::autograd(format!(
                "item() on tensor of shape {:?}",
                self.shape
            )));
        }
        Ok(self.data[0])
    }

    /// `(rows, cols)` of a 2-D tensor
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(MetaError::autograd(format!("expected a 2-D tensor, got shape {:?}", other))),
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn sum_sq(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Element-wise combination of two same-shape tensors
    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(MetaError::autograd(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Ok(Tensor { shape: self.shape.clone(), data })
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor { shape: self.shape.clone(), data: self.data.iter().map(|&x| f(x)).collect() }
    }
}

// ── Kernels on flat slices ────────────────────────────────────────────

/// C[M,N] = A[M,K] @ B[K,N]
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += a_ip * b[p * n + j];
            }
        }
    }
    out
}

/// out[cols, rows] = A[rows, cols]^T
pub fn transpose(a: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    debug_assert_eq!(a.len(), rows * cols);
    let mut out = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = a[i * cols + j];
        }
    }
    out
}

/// out[t, :] = a[idx[t], :]
pub fn gather_rows(a: &[f64], cols: usize, idx: &[usize]) -> Vec<f64> {
    let mut out = Vec::with_capacity(idx.len() * cols);
    for &r in idx {
        out.extend_from_slice(&a[r * cols..(r + 1) * cols]);
    }
    out
}

/// out[idx[t], :] += a[t, :], out has `rows` rows
pub fn scatter_add_rows(a: &[f64], cols: usize, idx: &[usize], rows: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * cols];
    for (t, &r) in idx.iter().enumerate() {
        let src = &a[t * cols..(t + 1) * cols];
        for (o, s) in out[r * cols..(r + 1) * cols].iter_mut().zip(src) {
            *o += s;
        }
    }
    out
}
