//! Adaptable models.
//!
//! A model holds hyperparameters only. Parameters live in a `ParamSet` owned by the outer
//! driver and reach the model as tape handles, which is what lets the inner loop evaluate the
//! same model on adapted copies.

use std::collections::BTreeSet;
use std::rc::Rc;

use confmeta_autograd::{ParamSet, ParamVars, Tape, Tensor, VarId};
use confmeta_core::{MetaError, ModelConfig, Result};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::molecule::{ConformationExample, MolBatch};

/// Per-call inputs to the loss that are not parameters or data.
#[derive(Debug, Clone)]
pub struct LossContext {
    /// Exponent of the `sigma^p` loss weight
    pub anneal_power: f64,
    /// Source of noise levels and perturbations
    pub rng: ChaCha8Rng,
}

/// Loss handles for one batch of examples.
#[derive(Debug, Clone, Copy)]
pub struct ModelLoss {
    /// Unreduced loss, one row per example
    pub per_example: VarId,
    /// Scalar loss over long-range edges
    pub aux_global: VarId,
    /// Scalar loss over bonded edges
    pub aux_local: VarId,
}

/// A parameter-free model whose loss is differentiable in its parameters.
pub trait AdaptableModel {
    type Example: Clone;

    fn name(&self) -> &str;

    /// Fresh parameter set
    fn init_params(&self, rng: &mut ChaCha8Rng) -> ParamSet;

    fn loss(
        &self,
        tape: &mut Tape,
        params: &ParamVars,
        examples: &[Self::Example],
        ctx: &mut LossContext,
    ) -> Result<ModelLoss>;

    /// `(file name, contents)` pairs copied into new run directories
    fn source_files(&self) -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }
}

/// Build the model named by `model.type`.
pub fn get_model(config: &ModelConfig) -> Result<EdgeScoreModel> {
    match config.kind.as_str() {
        "edge_score" => EdgeScoreModel::new(config),
        other => Err(MetaError::config(format!("unknown model type '{}'", other))),
    }
}

// ============================================================================
// EDGE SCORE MODEL
// ============================================================================

const MODEL_SOURCE: &str = include_str!("model.rs");

/// Distance score-matching denoiser over bonded and radius edges.
///
/// Each edge gets a feature from its endpoint atom embeddings, its bond embedding (row 0 for
/// non-bonded radius edges) and its perturbed length, which a two-layer MLP maps to a score.
/// The score is trained against the denoising target `-(d_noisy - d) / sigma^2`, weighted by
/// `sigma^anneal_power`.
#[derive(Debug, Clone)]
pub struct EdgeScoreModel {
    config: ModelConfig,
    sigmas: Vec<f64>,
}

/// Edge list built from clean coordinates
struct EdgeSet {
    src: Vec<usize>,
    dst: Vec<usize>,
    kind: Vec<usize>,
    graph: Vec<usize>,
}

impl EdgeScoreModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        if config.num_noise_levels == 0 {
            return Err(MetaError::config("model.num_noise_levels must be greater than 0"));
        }
        if !(config.sigma_begin > 0.0 && config.sigma_end > 0.0) {
            return Err(MetaError::config("model sigmas must be positive"));
        }
        Ok(EdgeScoreModel { config: config.clone(), sigmas: noise_ladder(config) })
    }

    /// Geometric noise ladder from `sigma_begin` down to `sigma_end`
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn check_types(&self, batch: &MolBatch) -> Result<()> {
        if let Some(&t) = batch.atom_type.iter().find(|&&t| t >= self.config.num_atom_types) {
            return Err(MetaError::dataset(format!(
                "atom type {} outside [0, {})",
                t, self.config.num_atom_types
            )));
        }
        if let Some(&t) = batch
            .bond_type
            .iter()
            .find(|&&t| t == 0 || t > self.config.num_bond_types)
        {
            return Err(MetaError::dataset(format!(
                "bond type {} outside [1, {}]",
                t, self.config.num_bond_types
            )));
        }
        Ok(())
    }

    /// Bonds (both listed directions collapse to one edge) plus non-bonded pairs within the
    /// cutoff in the same graph.
    fn build_edges(&self, batch: &MolBatch) -> EdgeSet {
        let mut edges = EdgeSet { src: Vec::new(), dst: Vec::new(), kind: Vec::new(), graph: Vec::new() };
        let mut bonded = BTreeSet::new();
        for (&[i, j], &t) in batch.bond_index.iter().zip(&batch.bond_type) {
            let key = (i.min(j), i.max(j));
            if bonded.insert(key) {
                edges.src.push(key.0);
                edges.dst.push(key.1);
                edges.kind.push(t);
                edges.graph.push(batch.batch[i]);
            }
        }

        let cutoff_sq = self.config.cutoff * self.config.cutoff;
        for (g, (&start, &n)) in batch.node_offsets().iter().zip(&batch.num_nodes_per_graph).enumerate() {
            for i in start..start + n {
                for j in i + 1..start + n {
                    if bonded.contains(&(i, j)) {
                        continue;
                    }
                    if dist_sq(&batch.pos[i], &batch.pos[j]) <= cutoff_sq {
                        edges.src.push(i);
                        edges.dst.push(j);
                        edges.kind.push(0);
                        edges.graph.push(g);
                    }
                }
            }
        }
        edges
    }
}

fn noise_ladder(config: &ModelConfig) -> Vec<f64> {
    let n = config.num_noise_levels;
    if n == 1 {
        return vec![config.sigma_begin];
    }
    let (a, b) = (config.sigma_begin.ln(), config.sigma_end.ln());
    (0..n).map(|i| (a + (b - a) * i as f64 / (n - 1) as f64).exp()).collect()
}

fn dist_sq(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (0..3).map(|k| (a[k] - b[k]).powi(2)).sum()
}

/// `[n, 1]` column constant
fn column(tape: &mut Tape, values: Vec<f64>) -> Result<VarId> {
    let n = values.len();
    Ok(tape.constant(Tensor::matrix(n, 1, values)?))
}

impl AdaptableModel for EdgeScoreModel {
    type Example = ConformationExample;

    fn name(&self) -> &str {
        &self.config.kind
    }

    fn init_params(&self, rng: &mut ChaCha8Rng) -> ParamSet {
        let c = &self.config;
        let h = c.hidden_dim;
        let std = c.init_std;
        let mut params = ParamSet::new();
        params.insert("atom_embedding", Tensor::randn(&[c.num_atom_types, h], std, rng));
        params.insert("bond_embedding", Tensor::randn(&[c.num_bond_types + 1, h], std, rng));
        params.insert("distance_proj", Tensor::randn(&[1, h], std, rng));
        params.insert("edge_w1", Tensor::randn(&[h, h], std, rng));
        params.insert("edge_b1", Tensor::zeros(&[h]));
        params.insert("edge_w2", Tensor::randn(&[h, 1], std, rng));
        params.insert("edge_b2", Tensor::zeros(&[1]));
        params
    }

    fn loss(
        &self,
        tape: &mut Tape,
        params: &ParamVars,
        examples: &[ConformationExample],
        ctx: &mut LossContext,
    ) -> Result<ModelLoss> {
        let batch = MolBatch::collate(examples)?;
        self.check_types(&batch)?;
        let edges = self.build_edges(&batch);
        let num_graphs = batch.num_graphs();
        let num_edges = edges.src.len();

        // ── Perturb coordinates: one noise level per graph ───────────
        let graph_sigma: Vec<f64> = (0..num_graphs)
            .map(|_| self.sigmas[ctx.rng.gen_range(0..self.sigmas.len())])
            .collect();
        let mut noisy = batch.pos.clone();
        for (node, p) in noisy.iter_mut().enumerate() {
            let normal = Normal::new(0.0, graph_sigma[batch.batch[node]])
                .map_err(|e| MetaError::numerical(e.to_string()))?;
            for x in p.iter_mut() {
                *x += normal.sample(&mut ctx.rng);
            }
        }

        let mut d_noisy = Vec::with_capacity(num_edges);
        let mut inv_sigma = Vec::with_capacity(num_edges);
        let mut target = Vec::with_capacity(num_edges);
        let mut weight = Vec::with_capacity(num_edges);
        for e in 0..num_edges {
            let (i, j) = (edges.src[e], edges.dst[e]);
            let d = dist_sq(&batch.pos[i], &batch.pos[j]).sqrt();
            let dn = dist_sq(&noisy[i], &noisy[j]).sqrt();
            let sigma = graph_sigma[edges.graph[e]];
            d_noisy.push(dn);
            inv_sigma.push(1.0 / sigma);
            target.push(-(dn - d) / (sigma * sigma));
            weight.push(0.5 * sigma.powf(ctx.anneal_power));
        }

        // ── Edge scores ──────────────────────────────────────────────
        let atom_emb = params.get("atom_embedding")?;
        let bond_emb = params.get("bond_embedding")?;
        let src_types: Rc<[usize]> = edges.src.iter().map(|&i| batch.atom_type[i]).collect();
        let dst_types: Rc<[usize]> = edges.dst.iter().map(|&i| batch.atom_type[i]).collect();
        let is_bond: Vec<bool> = edges.kind.iter().map(|&k| k != 0).collect();
        let kinds: Rc<[usize]> = Rc::from(edges.kind);

        let h_src = tape.gather_rows(atom_emb, src_types)?;
        let h_dst = tape.gather_rows(atom_emb, dst_types)?;
        let h_bond = tape.gather_rows(bond_emb, kinds)?;
        let d_col = column(tape, d_noisy)?;
        let h_dist = tape.matmul(d_col, params.get("distance_proj")?)?;

        let h = tape.add(h_src, h_dst)?;
        let h = tape.add(h, h_bond)?;
        let h = tape.add(h, h_dist)?;
        let h = tape.tanh(h)?;
        let h = tape.matmul(h, params.get("edge_w1")?)?;
        let h = tape.add_row_bias(h, params.get("edge_b1")?)?;
        let h = tape.tanh(h)?;
        let out = tape.matmul(h, params.get("edge_w2")?)?;
        let out = tape.add_row_bias(out, params.get("edge_b2")?)?;

        // ── Weighted score matching ──────────────────────────────────
        let inv_sigma = column(tape, inv_sigma)?;
        let pred = tape.mul(out, inv_sigma)?;
        let target = column(tape, target)?;
        let diff = tape.sub(pred, target)?;
        let sq = tape.mul(diff, diff)?;
        let weight = column(tape, weight)?;
        let edge_loss = tape.mul(sq, weight)?;

        let mut edges_per_graph = vec![0usize; num_graphs];
        for &g in &edges.graph {
            edges_per_graph[g] += 1;
        }
        let inv_count: Vec<f64> = edges_per_graph
            .iter()
            .map(|&c| if c == 0 { 0.0 } else { 1.0 / c as f64 })
            .collect();
        let graph_idx: Rc<[usize]> = Rc::from(edges.graph);
        let per_graph = tape.scatter_add_rows(edge_loss, graph_idx, num_graphs)?;
        let inv_count = column(tape, inv_count)?;
        let per_example = tape.mul(per_graph, inv_count)?;

        let aux_local = masked_mean(tape, edge_loss, &is_bond, true)?;
        let aux_global = masked_mean(tape, edge_loss, &is_bond, false)?;

        Ok(ModelLoss { per_example, aux_global, aux_local })
    }

    fn source_files(&self) -> Vec<(&'static str, &'static str)> {
        vec![("model.rs", MODEL_SOURCE)]
    }
}

/// Mean of `values[e]` over edges whose bond flag equals `bonded`; zero when there are none.
fn masked_mean(tape: &mut Tape, values: VarId, is_bond: &[bool], bonded: bool) -> Result<VarId> {
    let mask: Vec<f64> = is_bond.iter().map(|&b| if b == bonded { 1.0 } else { 0.0 }).collect();
    let count = mask.iter().sum::<f64>();
    let mask = column(tape, mask)?;
    let masked = tape.mul(values, mask)?;
    let total = tape.sum(masked)?;
    tape.scale(total, if count > 0.0 { 1.0 / count } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::tests::water;
    use approx::assert_relative_eq;
    use confmeta_autograd::GradMode;
    use rand::SeedableRng;

    fn small_model() -> EdgeScoreModel {
        let config = ModelConfig { hidden_dim: 8, num_atom_types: 10, ..ModelConfig::default() };
        get_model(&config).unwrap()
    }

    fn ctx(seed: u64) -> LossContext {
        LossContext { anneal_power: 2.0, rng: ChaCha8Rng::seed_from_u64(seed) }
    }

    fn total_loss(model: &EdgeScoreModel, params: &ParamSet, examples: &[ConformationExample], seed: u64) -> f64 {
        let mut tape = Tape::new();
        let vars = params.register_constant(&mut tape);
        let loss = model.loss(&mut tape, &vars, examples, &mut ctx(seed)).unwrap();
        tape.value(loss.per_example).unwrap().sum()
    }

    #[test]
    fn test_unknown_model_type() {
        let config = ModelConfig { kind: "schnet".to_string(), ..ModelConfig::default() };
        assert!(get_model(&config).unwrap_err().is_config_error());
    }

    #[test]
    fn test_noise_ladder_is_geometric() {
        let model = small_model();
        let s = model.sigmas();
        assert_eq!(s.len(), 50);
        assert_relative_eq!(s[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(s[49], 0.01, epsilon = 1e-12);
        assert_relative_eq!(s[1] / s[0], s[2] / s[1], epsilon = 1e-12);
    }

    #[test]
    fn test_loss_has_one_row_per_example() {
        let model = small_model();
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(0));
        let mut tape = Tape::new();
        let vars = params.register(&mut tape);
        let examples = vec![water(0.0), water(3.0), water(6.0)];
        let loss = model.loss(&mut tape, &vars, &examples, &mut ctx(1)).unwrap();
        let per_example = tape.value(loss.per_example).unwrap();
        assert_eq!(per_example.shape, vec![3, 1]);
        assert!(per_example.is_finite());
        assert!(per_example.data.iter().all(|&x| x >= 0.0));
        assert!(tape.scalar(loss.aux_local).unwrap() >= 0.0);
        assert!(tape.scalar(loss.aux_global).unwrap() >= 0.0);
    }

    #[test]
    fn test_loss_is_deterministic_for_a_seed() {
        let model = small_model();
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(0));
        let examples = vec![water(0.0), water(1.0)];
        assert_eq!(total_loss(&model, &params, &examples, 4), total_loss(&model, &params, &examples, 4));
    }

    #[test]
    fn test_bias_gradient_matches_finite_difference() {
        let model = small_model();
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(2));
        let examples = vec![water(0.0), water(2.0)];

        let mut tape = Tape::new();
        let vars = params.register(&mut tape);
        let loss = model.loss(&mut tape, &vars, &examples, &mut ctx(7)).unwrap();
        let total = tape.sum(loss.per_example).unwrap();
        let b2 = vars.get("edge_b2").unwrap();
        let g = tape.grad(total, &[b2], GradMode::Detached).unwrap()[0];
        let analytic = tape.value(g).unwrap().data[0];

        let h = 1e-6;
        let mut plus = params.clone();
        plus.get_mut("edge_b2").unwrap().data[0] += h;
        let mut minus = params.clone();
        minus.get_mut("edge_b2").unwrap().data[0] -= h;
        let numeric = (total_loss(&model, &plus, &examples, 7) - total_loss(&model, &minus, &examples, 7)) / (2.0 * h);
        assert_relative_eq!(analytic, numeric, epsilon = 1e-5, max_relative = 1e-5);
    }

    #[test]
    fn test_out_of_range_atom_type_is_dataset_error() {
        let model = small_model();
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(0));
        let mut bad = water(0.0);
        bad.atom_type[0] = 42;
        let mut tape = Tape::new();
        let vars = params.register(&mut tape);
        let err = model.loss(&mut tape, &vars, &[bad], &mut ctx(0)).unwrap_err();
        assert!(matches!(err, MetaError::Dataset(_)));
    }

    #[test]
    fn test_source_snapshot_is_available() {
        let files = small_model().source_files();
        assert_eq!(files[0].0, "model.rs");
        assert!(files[0].1.contains("EdgeScoreModel"));
    }
}
