//! Global-norm gradient clipping.

use crate::params::ParamSet;

/// Clip `grads` so their global L2 norm is at most `max_norm`.
///
/// Returns the norm *before* clipping (for logging). Above the limit every gradient is scaled
/// by exactly `max_norm / norm`; at or below it nothing changes. A non-finite norm is returned
/// as-is without touching the gradients.
pub fn clip_grad_norm(grads: &mut ParamSet, max_norm: f64) -> f64 {
    let norm = grads.global_norm();
    if norm.is_finite() && norm > max_norm {
        grads.scale(max_norm / norm);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    fn grads(values: Vec<f64>) -> ParamSet {
        let mut g = ParamSet::new();
        g.insert("a", Tensor::vector(values));
        g
    }

    #[test]
    fn test_clip_above_max() {
        let mut g = grads(vec![30.0, 40.0]);
        let norm = clip_grad_norm(&mut g, 10.0);
        assert_eq!(norm, 50.0);
        assert_eq!(g.get("a").unwrap().data, vec![6.0, 8.0]);
        assert_relative_eq!(g.global_norm(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_below_max_is_untouched() {
        let mut g = grads(vec![3.0, 4.0]);
        let before = g.clone();
        assert_eq!(clip_grad_norm(&mut g, 10.0), 5.0);
        assert_eq!(g, before);
    }

    #[test]
    fn test_non_finite_norm_is_reported() {
        let mut g = grads(vec![f64::NAN, 1.0]);
        assert!(clip_grad_norm(&mut g, 1.0).is_nan());
    }
}
