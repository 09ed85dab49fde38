// Wengert tape: reverse-mode AD that can differentiate its own gradients.
//
// Forward values are computed eagerly and stored on the tape. `grad()` walks the
// tape in reverse and *records* every vector-Jacobian product as ordinary tape
// ops, so the gradients it returns are themselves differentiable handles. Taking
// a gradient of an expression that contains gradients gives second-order terms.
//
// With `GradMode::Detached` the VJPs are recorded with gradient tracking off,
// which yields plain constants (first-order truncation).

use std::rc::Rc;

use confmeta_core::{MetaError, Result};

use crate::tensor::{self, Tensor};

// ── Handles ──────────────────────────────────────────────────────────

/// Index of a value on the tape. Stable for the lifetime of the tape.
pub type VarId = usize;

/// Added to `sqrt` outputs before dividing in the backward rule, so that
/// zero second-moment entries give a finite (zero-weighted) derivative.
const SQRT_GRAD_FLOOR: f64 = 1e-30;

/// Whether gradients returned by [`Tape::grad`] keep their history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradMode {
    /// Record the backward pass so the result can be differentiated again
    CreateGraph,
    /// Return constants; nothing downstream can differentiate through them
    Detached,
}

#[derive(Clone, Debug)]
enum Op {
    Leaf,
    Add(VarId, VarId),
    Sub(VarId, VarId),
    Mul(VarId, VarId),
    Div(VarId, VarId),
    Neg(VarId),
    Scale(VarId, f64),
    AddScalar(VarId, f64),
    Powf(VarId, f64),
    Sqrt(VarId),
    Tanh(VarId),
    /// Full reduction to a scalar
    Sum(VarId),
    /// Scalar broadcast to a shape
    Expand(VarId, Vec<usize>),
    MatMul(VarId, VarId),
    Transpose(VarId),
    /// `[m, n] + [n]`
    AddRowBias(VarId, VarId),
    /// `[m, n] -> [n]`
    SumRows(VarId),
    /// `[n] -> [m, n]`
    BroadcastRows(VarId, usize),
    GatherRows(VarId, Rc<[usize]>),
    ScatterAddRows(VarId, Rc<[usize]>, usize),
}

#[derive(Clone, Debug)]
struct Node {
    value: Tensor,
    op: Op,
    requires_grad: bool,
}

// ── Tape ─────────────────────────────────────────────────────────────

/// Linear record of every value computed for one task.
#[derive(Debug)]
pub struct Tape {
    nodes: Vec<Node>,
    grad_enabled: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape { nodes: Vec::new(), grad_enabled: true }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaf that gradients flow into.
    pub fn param(&mut self, value: Tensor) -> VarId {
        self.nodes.push(Node { value, op: Op::Leaf, requires_grad: true });
        self.nodes.len() - 1
    }

    /// Leaf that never receives gradients (data, targets, masks).
    pub fn constant(&mut self, value: Tensor) -> VarId {
        self.nodes.push(Node { value, op: Op::Leaf, requires_grad: false });
        self.nodes.len() - 1
    }

    /// Copy of `v`'s value with no history.
    pub fn detach(&mut self, v: VarId) -> Result<VarId> {
        let value = self.value(v)?.clone();
        Ok(self.constant(value))
    }

    pub fn value(&self, v: VarId) -> Result<&Tensor> {
        self.nodes
            .get(v)
            .map(|n| &n.value)
            .ok_or_else(|| MetaError::autograd(format!("unknown tape handle {}", v)))
    }

    /// Value of a single-element handle
    pub fn scalar(&self, v: VarId) -> Result<f64> {
        self.value(v)?.item()
    }

    pub fn requires_grad(&self, v: VarId) -> bool {
        self.nodes.get(v).map(|n| n.requires_grad).unwrap_or(false)
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Toggle history recording; returns the previous setting.
    pub fn set_grad_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.grad_enabled, enabled)
    }

    fn shape(&self, v: VarId) -> Result<&[usize]> {
        Ok(&self.value(v)?.shape)
    }

    fn push(&mut self, value: Tensor, op: Op, inputs: &[VarId]) -> VarId {
        let requires_grad = self.grad_enabled && inputs.iter().any(|&i| self.requires_grad(i));
        let op = if requires_grad { op } else { Op::Leaf };
        self.nodes.push(Node { value, op, requires_grad });
        self.nodes.len() - 1
    }

    // ── Element-wise ops ─────────────────────────────────────────────

    fn binary(&mut self, a: VarId, b: VarId, op: Op, f: impl Fn(f64, f64) -> f64) -> Result<VarId> {
        let value = self.value(a)?.zip_map(self.value(b)?, f)?;
        Ok(self.push(value, op, &[a, b]))
    }

    pub fn add(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(a, b, Op::Add(a, b), |x, y| x + y)
    }

    pub fn sub(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(a, b, Op::Sub(a, b), |x, y| x - y)
    }

    pub fn mul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(a, b, Op::Mul(a, b), |x, y| x * y)
    }

    pub fn div(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(a, b, Op::Div(a, b), |x, y| x / y)
    }

    pub fn neg(&mut self, a: VarId) -> Result<VarId> {
        let value = self.value(a)?.map(|x| -x);
        Ok(self.push(value, Op::Neg(a), &[a]))
    }

    pub fn scale(&mut self, a: VarId, c: f64) -> Result<VarId> {
        let value = self.value(a)?.map(|x| x * c);
        Ok(self.push(value, Op::Scale(a, c), &[a]))
    }

    pub fn add_scalar(&mut self, a: VarId, c: f64) -> Result<VarId> {
        let value = self.value(a)?.map(|x| x + c);
        Ok(self.push(value, Op::AddScalar(a, c), &[a]))
    }

    pub fn powf(&mut self, a: VarId, p: f64) -> Result<VarId> {
        let value = self.value(a)?.map(|x| x.powf(p));
        Ok(self.push(value, Op::Powf(a, p), &[a]))
    }

    pub fn sqrt(&mut self, a: VarId) -> Result<VarId> {
        let value = self.value(a)?.map(f64::sqrt);
        Ok(self.push(value, Op::Sqrt(a), &[a]))
    }

    pub fn tanh(&mut self, a: VarId) -> Result<VarId> {
        let value = self.value(a)?.map(f64::tanh);
        Ok(self.push(value, Op::Tanh(a), &[a]))
    }

    // ── Reductions & broadcasts ──────────────────────────────────────

    /// Sum of all elements as a scalar
    pub fn sum(&mut self, a: VarId) -> Result<VarId> {
        let value = Tensor::scalar(self.value(a)?.sum());
        Ok(self.push(value, Op::Sum(a), &[a]))
    }

    pub fn mean(&mut self, a: VarId) -> Result<VarId> {
        let n = self.value(a)?.numel();
        if n == 0 {
            return Err(MetaError::autograd("mean of an empty tensor"));
        }
        let s = self.sum(a)?;
        self.scale(s, 1.0 / n as f64)
    }

    /// Broadcast a single-element value to `shape`
    pub fn expand(&mut self, a: VarId, shape: &[usize]) -> Result<VarId> {
        let v = self.value(a)?.item()?;
        let value = Tensor::filled(shape, v);
        Ok(self.push(value, Op::Expand(a, shape.to_vec()), &[a]))
    }

    pub fn sum_rows(&mut self, a: VarId) -> Result<VarId> {
        let (m, n) = self.value(a)?.dims2()?;
        let data = self.value(a)?.data.as_slice();
        let mut out = vec![0.0; n];
        for i in 0..m {
            for (o, x) in out.iter_mut().zip(&data[i * n..(i + 1) * n]) {
                *o += x;
            }
        }
        Ok(self.push(Tensor::vector(out), Op::SumRows(a), &[a]))
    }

    pub fn broadcast_rows(&mut self, a: VarId, m: usize) -> Result<VarId> {
        let row = self.value(a)?;
        if row.shape.len() != 1 {
            return Err(MetaError::autograd(format!(
                "broadcast_rows expects a 1-D tensor, got shape {:?}",
                row.shape
            )));
        }
        let n = row.numel();
        let data = row.data.iter().copied().cycle().take(m * n).collect();
        let value = Tensor::matrix(m, n, data)?;
        Ok(self.push(value, Op::BroadcastRows(a, m), &[a]))
    }

    // ── Linear algebra ───────────────────────────────────────────────

    pub fn matmul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        let (m, k) = self.value(a)?.dims2()?;
        let (k2, n) = self.value(b)?.dims2()?;
        if k != k2 {
            return Err(MetaError::autograd(format!(
                "matmul inner dimensions differ: [{}, {}] @ [{}, {}]",
                m, k, k2, n
            )));
        }
        let data = tensor::matmul(&self.value(a)?.data, &self.value(b)?.data, m, k, n);
        let value = Tensor::matrix(m, n, data)?;
        Ok(self.push(value, Op::MatMul(a, b), &[a, b]))
    }

    pub fn transpose(&mut self, a: VarId) -> Result<VarId> {
        let (m, n) = self.value(a)?.dims2()?;
        let data = tensor::transpose(&self.value(a)?.data, m, n);
        let value = Tensor::matrix(n, m, data)?;
        Ok(self.push(value, Op::Transpose(a), &[a]))
    }

    pub fn add_row_bias(&mut self, a: VarId, bias: VarId) -> Result<VarId> {
        let (m, n) = self.value(a)?.dims2()?;
        let bias_shape = self.shape(bias)?.to_vec();
        if bias_shape != vec![n] {
            return Err(MetaError::autograd(format!(
                "bias shape {:?} does not match row width {}",
                bias_shape, n
            )));
        }
        let b = &self.value(bias)?.data;
        let data = self.value(a)?.data.iter().enumerate().map(|(i, x)| x + b[i % n]).collect();
        let value = Tensor::matrix(m, n, data)?;
        Ok(self.push(value, Op::AddRowBias(a, bias), &[a, bias]))
    }

    // ── Indexing ─────────────────────────────────────────────────────

    /// Row lookup (embeddings, edge endpoints)
    pub fn gather_rows(&mut self, a: VarId, idx: Rc<[usize]>) -> Result<VarId> {
        let (r, c) = self.value(a)?.dims2()?;
        if let Some(&bad) = idx.iter().find(|&&i| i >= r) {
            return Err(MetaError::autograd(format!("gather index {} out of range for {} rows", bad, r)));
        }
        let data = tensor::gather_rows(&self.value(a)?.data, c, &idx);
        let value = Tensor::matrix(idx.len(), c, data)?;
        Ok(self.push(value, Op::GatherRows(a, idx), &[a]))
    }

    /// Segment sum: row `t` of `a` is added into output row `idx[t]`
    pub fn scatter_add_rows(&mut self, a: VarId, idx: Rc<[usize]>, rows: usize) -> Result<VarId> {
        let (len, c) = self.value(a)?.dims2()?;
        if len != idx.len() {
            return Err(MetaError::autograd(format!(
                "scatter of {} rows with {} indices",
                len,
                idx.len()
            )));
        }
        if let Some(&bad) = idx.iter().find(|&&i| i >= rows) {
            return Err(MetaError::autograd(format!("scatter index {} out of range for {} rows", bad, rows)));
        }
        let data = tensor::scatter_add_rows(&self.value(a)?.data, c, &idx, rows);
        let value = Tensor::matrix(rows, c, data)?;
        Ok(self.push(value, Op::ScatterAddRows(a, idx, rows), &[a]))
    }

    // ── Backward ─────────────────────────────────────────────────────

    /// Gradients of the scalar `output` with respect to each handle in `wrt`.
    ///
    /// Handles that `output` does not depend on get a zero constant of the right shape.
    pub fn grad(&mut self, output: VarId, wrt: &[VarId], mode: GradMode) -> Result<Vec<VarId>> {
        if !self.value(output)?.is_scalar() {
            return Err(MetaError::autograd(format!(
                "grad() needs a scalar output, got shape {:?}",
                self.value(output)?.shape
            )));
        }
        for &w in wrt {
            self.value(w)?;
        }

        let previous = self.set_grad_enabled(mode == GradMode::CreateGraph);
        let result = self.backward(output, wrt);
        self.set_grad_enabled(previous);
        result
    }

    fn backward(&mut self, output: VarId, wrt: &[VarId]) -> Result<Vec<VarId>> {
        let mut adjoint: Vec<Option<VarId>> = vec![None; output + 1];
        let seed_shape = self.value(output)?.shape.clone();
        adjoint[output] = Some(self.constant(Tensor::filled(&seed_shape, 1.0)));

        for i in (0..=output).rev() {
            let Some(g) = adjoint[i] else { continue };
            if !self.nodes[i].requires_grad {
                continue;
            }
            let op = self.nodes[i].op.clone();
            match op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    self.accumulate(&mut adjoint, a, g)?;
                    self.accumulate(&mut adjoint, b, g)?;
                }
                Op::Sub(a, b) => {
                    self.accumulate(&mut adjoint, a, g)?;
                    if self.requires_grad(b) {
                        let gb = self.neg(g)?;
                        self.accumulate(&mut adjoint, b, gb)?;
                    }
                }
                Op::Mul(a, b) => {
                    if self.requires_grad(a) {
                        let ga = self.mul(g, b)?;
                        self.accumulate(&mut adjoint, a, ga)?;
                    }
                    if self.requires_grad(b) {
                        let gb = self.mul(g, a)?;
                        self.accumulate(&mut adjoint, b, gb)?;
                    }
                }
                Op::Div(a, b) => {
                    if self.requires_grad(a) {
                        let ga = self.div(g, b)?;
                        self.accumulate(&mut adjoint, a, ga)?;
                    }
                    if self.requires_grad(b) {
                        // d(a/b)/db = -out / b
                        let t = self.mul(g, i)?;
                        let t = self.div(t, b)?;
                        let gb = self.neg(t)?;
                        self.accumulate(&mut adjoint, b, gb)?;
                    }
                }
                Op::Neg(a) => {
                    let ga = self.neg(g)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::Scale(a, c) => {
                    let ga = self.scale(g, c)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::AddScalar(a, _) => {
                    self.accumulate(&mut adjoint, a, g)?;
                }
                Op::Powf(a, p) => {
                    let t = self.powf(a, p - 1.0)?;
                    let t = self.scale(t, p)?;
                    let ga = self.mul(g, t)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::Sqrt(a) => {
                    let t = self.add_scalar(i, SQRT_GRAD_FLOOR)?;
                    let t = self.div(g, t)?;
                    let ga = self.scale(t, 0.5)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::Tanh(a) => {
                    // 1 - y^2
                    let y2 = self.mul(i, i)?;
                    let t = self.neg(y2)?;
                    let t = self.add_scalar(t, 1.0)?;
                    let ga = self.mul(g, t)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::Sum(a) => {
                    let shape = self.value(a)?.shape.clone();
                    let ga = self.expand(g, &shape)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::Expand(a, _) => {
                    let s = self.sum(g)?;
                    // keep the input's own (possibly [1]) shape
                    let shape = self.value(a)?.shape.clone();
                    let ga = if shape.is_empty() { s } else { self.expand(s, &shape)? };
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::MatMul(a, b) => {
                    if self.requires_grad(a) {
                        let bt = self.transpose(b)?;
                        let ga = self.matmul(g, bt)?;
                        self.accumulate(&mut adjoint, a, ga)?;
                    }
                    if self.requires_grad(b) {
                        let at = self.transpose(a)?;
                        let gb = self.matmul(at, g)?;
                        self.accumulate(&mut adjoint, b, gb)?;
                    }
                }
                Op::Transpose(a) => {
                    let ga = self.transpose(g)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::AddRowBias(a, bias) => {
                    self.accumulate(&mut adjoint, a, g)?;
                    if self.requires_grad(bias) {
                        let gb = self.sum_rows(g)?;
                        self.accumulate(&mut adjoint, bias, gb)?;
                    }
                }
                Op::SumRows(a) => {
                    let (m, _) = self.value(a)?.dims2()?;
                    let ga = self.broadcast_rows(g, m)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::BroadcastRows(a, _) => {
                    let ga = self.sum_rows(g)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::GatherRows(a, idx) => {
                    let (rows, _) = self.value(a)?.dims2()?;
                    let ga = self.scatter_add_rows(g, idx, rows)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
                Op::ScatterAddRows(a, idx, _) => {
                    let ga = self.gather_rows(g, idx)?;
                    self.accumulate(&mut adjoint, a, ga)?;
                }
            }
        }

        let mut grads = Vec::with_capacity(wrt.len());
        for &w in wrt {
            let g = match adjoint.get(w).copied().flatten() {
                Some(g) => g,
                None => {
                    let shape = self.value(w)?.shape.clone();
                    self.constant(Tensor::zeros(&shape))
                }
            };
            grads.push(g);
        }
        Ok(grads)
    }

    fn accumulate(&mut self, adjoint: &mut [Option<VarId>], target: VarId, contrib: VarId) -> Result<()> {
        if !self.requires_grad(target) {
            return Ok(());
        }
        adjoint[target] = Some(match adjoint[target] {
            None => contrib,
            Some(prev) => self.add(prev, contrib)?,
        });
        Ok(())
    }
}
