//! Score aggregation into per-unit attributions
//!
//! Aggregators reduce the `(scores, mask)` pair of one perturbed batch to one
//! attribution row per target column: output shape `(targets, units)`. All
//! aggregators are pure functions of their arguments.
//!
//! ## Generic reduction
//!
//! [`GenericAggregator`] takes the mean score over unperturbed variants
//! (all-zero mask rows) as the baseline and subtracts, per unit, the
//! mask-weighted mean score over the variants that perturb it. For occlusion
//! this reduces exactly to `score(unperturbed) - score(unit masked)`. The
//! reduction is linear in the scores.
//!
//! ## Sobol indices
//!
//! [`SobolAggregator`] consumes the paired block design of
//! `SobolMaskPerturbator`: with `k` draws and `l` units, the first `k` rows
//! are the base design and block `i` holds its paired variants for unit
//! `i - 1`. The index estimate for unit `i` is the mean squared difference
//! between paired scores, normalized by twice the base-block sample variance.
//! Zero variance is a valid degenerate case and yields zero attribution
//! rather than NaN.

use anyhow::{bail, ensure, Result};
use candle_core::Tensor;

/// Reduces one batch of variant scores to per-unit attributions.
pub trait Aggregator {
    /// Short name used in logs.
    fn label(&self) -> &'static str;

    /// Reduce `(variants, targets)` scores and a `(variants, units)` mask to
    /// `(targets, units)` attributions.
    fn aggregate(&self, scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor>;
}

/// Baseline-minus-masked-mean reduction for mask-producing strategies.
#[derive(Debug, Clone, Default)]
pub struct GenericAggregator;

impl Aggregator for GenericAggregator {
    fn label(&self) -> &'static str {
        "generic"
    }

    fn aggregate(&self, scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let Some(mask) = mask else {
            bail!("the generic aggregator needs a perturbation mask")
        };
        let score_rows = scores.to_vec2::<f32>()?;
        let mask_rows = mask.to_vec2::<f32>()?;
        let variants = score_rows.len();
        ensure!(
            mask_rows.len() == variants,
            "mask has {} rows but scores have {variants}",
            mask_rows.len()
        );
        ensure!(variants > 0, "cannot aggregate an empty batch");
        let targets = score_rows[0].len();
        let units = mask_rows[0].len();

        let unperturbed: Vec<usize> = (0..variants)
            .filter(|&v| mask_rows[v].iter().all(|&m| m == 0.0))
            .collect();
        let mut flat = Vec::with_capacity(targets * units);
        for c in 0..targets {
            let baseline = if unperturbed.is_empty() {
                score_rows.iter().map(|row| row[c]).sum::<f32>() / variants as f32
            } else {
                unperturbed.iter().map(|&v| score_rows[v][c]).sum::<f32>()
                    / unperturbed.len() as f32
            };
            for i in 0..units {
                let weight: f32 = mask_rows.iter().map(|row| row[i]).sum();
                if weight == 0.0 {
                    flat.push(0.0);
                    continue;
                }
                let weighted: f32 = mask_rows
                    .iter()
                    .zip(&score_rows)
                    .map(|(mask_row, score_row)| mask_row[i] * score_row[c])
                    .sum();
                flat.push(baseline - weighted / weight);
            }
        }
        Ok(Tensor::from_vec(flat, (targets, units), scores.device())?)
    }
}

/// Variance-normalized paired-difference estimator over the Sobol block
/// design.
#[derive(Debug, Clone)]
pub struct SobolAggregator {
    n_token_perturbations: usize,
}

impl SobolAggregator {
    pub fn new(n_token_perturbations: usize) -> Result<Self> {
        ensure!(n_token_perturbations > 0, "need at least one draw per block");
        Ok(Self {
            n_token_perturbations,
        })
    }
}

impl Aggregator for SobolAggregator {
    fn label(&self) -> &'static str {
        "sobol"
    }

    fn aggregate(&self, scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let Some(mask) = mask else {
            bail!("the sobol aggregator needs the block-design mask")
        };
        let k = self.n_token_perturbations;
        let (variants, units) = mask.dims2()?;
        ensure!(
            variants == (units + 1) * k,
            "expected {} variants for {units} units with {k} draws, got {variants}",
            (units + 1) * k
        );
        let score_rows = scores.to_vec2::<f32>()?;
        ensure!(
            score_rows.len() == variants,
            "scores have {} rows but the design has {variants}",
            score_rows.len()
        );
        let targets = score_rows[0].len();

        let mut flat = Vec::with_capacity(targets * units);
        for c in 0..targets {
            let base: Vec<f32> = (0..k).map(|j| score_rows[j][c]).collect();
            let mean = base.iter().sum::<f32>() / k as f32;
            let variance = if k < 2 {
                0.0
            } else {
                base.iter().map(|f| (f - mean) * (f - mean)).sum::<f32>() / (k - 1) as f32
            };
            if variance <= f32::EPSILON {
                // Constant output over the base design: nothing to attribute.
                flat.extend(std::iter::repeat(0.0).take(units));
                continue;
            }
            for i in 0..units {
                let offset = (i + 1) * k;
                let paired_sq: f32 = (0..k)
                    .map(|j| {
                        let d = base[j] - score_rows[offset + j][c];
                        d * d
                    })
                    .sum();
                flat.push(paired_sq / (2.0 * k as f32 * variance));
            }
        }
        Ok(Tensor::from_vec(flat, (targets, units), scores.device())?)
    }
}

/// Plain mean over variants for strategies without a mask.
///
/// Used with per-position scores (gradient magnitudes), where the variant
/// mean is already the attribution row.
#[derive(Debug, Clone, Default)]
pub struct MeanAggregator;

impl Aggregator for MeanAggregator {
    fn label(&self) -> &'static str {
        "mean"
    }

    fn aggregate(&self, scores: &Tensor, _mask: Option<&Tensor>) -> Result<Tensor> {
        Ok(scores.mean_keepdim(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use crate::perturbation::occlusion_mask;

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (values.len(), 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_generic_matches_occlusion_differences() {
        let mask = occlusion_mask(3, &Device::Cpu).unwrap();
        let scores = column(&[5.0, 3.0, 4.0, 1.0]);
        let attribution = GenericAggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 1.0, 4.0]]
        );
    }

    #[test]
    fn test_generic_handles_multiple_target_columns() {
        let mask = occlusion_mask(2, &Device::Cpu).unwrap();
        let scores = Tensor::from_vec(
            vec![5.0f32, 10.0, 3.0, 6.0, 4.0, 2.0],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let attribution = GenericAggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 1.0], vec![4.0, 8.0]]
        );
    }

    #[test]
    fn test_generic_weights_repeated_maskings() {
        let mask = Tensor::from_vec(
            vec![0.0f32, 0.0, 1.0, 0.0, 1.0, 1.0],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let scores = column(&[6.0, 2.0, 4.0]);
        let attribution = GenericAggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 2.0]]
        );
    }

    #[test]
    fn test_generic_never_masked_unit_scores_zero() {
        let mask = Tensor::from_vec(
            vec![0.0f32, 0.0, 1.0, 0.0],
            (2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let scores = column(&[6.0, 1.0]);
        let attribution = GenericAggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![5.0, 0.0]]
        );
    }

    #[test]
    fn test_generic_falls_back_to_global_baseline() {
        // No unperturbed variant: the baseline is the mean over all rows.
        let mask = Tensor::from_vec(
            vec![1.0f32, 0.0, 0.0, 1.0],
            (2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let scores = column(&[2.0, 4.0]);
        let attribution = GenericAggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, -1.0]]
        );
    }

    #[test]
    fn test_generic_requires_mask() {
        let scores = column(&[1.0, 2.0]);
        assert!(GenericAggregator.aggregate(&scores, None).is_err());
    }

    #[test]
    fn test_sobol_hand_computed_indices() {
        // k = 2, two units. Base scores (1, 3): variance 2. Unit 0's paired
        // block scores (2, 2) give squared differences summing to 2, so the
        // index is 2 / (2 * 2 * 2) = 0.25. Unit 1's block repeats the base
        // scores exactly, so its index is 0.
        let aggregator = SobolAggregator::new(2).unwrap();
        let mask = Tensor::zeros((6, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let scores = column(&[1.0, 3.0, 2.0, 2.0, 1.0, 3.0]);
        let attribution = aggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![0.25, 0.0]]
        );
    }

    #[test]
    fn test_sobol_zero_variance_yields_zeros() {
        let aggregator = SobolAggregator::new(2).unwrap();
        let mask = Tensor::zeros((4, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
        let scores = column(&[2.0, 2.0, 9.0, -4.0]);
        let attribution = aggregator.aggregate(&scores, Some(&mask)).unwrap();
        let values = attribution.to_vec2::<f32>().unwrap();
        assert_eq!(values, vec![vec![0.0]]);
        assert!(values[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sobol_single_draw_yields_zeros() {
        let aggregator = SobolAggregator::new(1).unwrap();
        let mask = Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let scores = column(&[5.0, 1.0, 2.0]);
        let attribution = aggregator.aggregate(&scores, Some(&mask)).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 0.0]]
        );
    }

    #[test]
    fn test_sobol_rejects_mismatched_design() {
        let aggregator = SobolAggregator::new(2).unwrap();
        let mask = Tensor::zeros((5, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let scores = column(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(aggregator.aggregate(&scores, Some(&mask)).is_err());
    }

    #[test]
    fn test_mean_aggregator_averages_variants() {
        let scores = Tensor::from_vec(
            vec![1.0f32, 2.0, 3.0, 5.0, 4.0, 3.0],
            (2, 3),
            &Device::Cpu,
        )
        .unwrap();
        let attribution = MeanAggregator.aggregate(&scores, None).unwrap();
        assert_eq!(
            attribution.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 3.0, 3.0]]
        );
    }
}
