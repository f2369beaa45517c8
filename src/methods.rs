//! Ready-made attribution methods
//!
//! An attribution method is a bundle of three choices: how inputs are
//! perturbed, how variants are scored, and how variant scores collapse into
//! per-unit attributions. The constructors below wire the bundles the library
//! ships with; [`by_name`] resolves them from strings for the command line.

use anyhow::{bail, Result};

use crate::aggregation::{Aggregator, GenericAggregator, MeanAggregator, SobolAggregator};
use crate::perturbation::{
    BaselineSpec, GaussianNoisePerturbator, LinearInterpolationPerturbator, MaskApplier,
    OcclusionPerturbator, Perturbator, RandomMaskPerturbator, SobolMaskPerturbator, SobolOrder,
};
use crate::sampling::SequenceSampler;

/// How variant scores are read from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringRule {
    /// Model outputs gathered at the target indices.
    TargetedLogits,
    /// Gradient magnitudes of the targeted outputs with respect to the input
    /// embeddings.
    Gradients,
}

/// One named bundle of perturbation, scoring, and aggregation.
pub struct AttributionMethod {
    pub name: &'static str,
    pub perturbator: Box<dyn Perturbator>,
    pub scoring: ScoringRule,
    pub aggregator: Box<dyn Aggregator>,
}

impl std::fmt::Debug for AttributionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributionMethod")
            .field("name", &self.name)
            .field("scoring", &self.scoring)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_N_PERTURBATIONS: usize = 30;
pub const DEFAULT_PERTURB_PROBABILITY: f64 = 0.5;
pub const DEFAULT_N_TOKEN_PERTURBATIONS: usize = 30;
pub const DEFAULT_NOISE_SIGMA: f64 = 0.1;

/// Leave-one-unit-out differences against the unperturbed score.
pub fn occlusion() -> AttributionMethod {
    AttributionMethod {
        name: "occlusion",
        perturbator: Box::new(OcclusionPerturbator::new(MaskApplier::new(0))),
        scoring: ScoringRule::TargetedLogits,
        aggregator: Box::new(GenericAggregator),
    }
}

/// Bernoulli masking averaged into per-unit score drops.
pub fn random_masking(
    n_perturbations: usize,
    perturb_probability: f64,
    seed: u64,
) -> Result<AttributionMethod> {
    Ok(AttributionMethod {
        name: "random-masking",
        perturbator: Box::new(RandomMaskPerturbator::new(
            MaskApplier::new(0),
            n_perturbations,
            perturb_probability,
            seed,
        )?),
        scoring: ScoringRule::TargetedLogits,
        aggregator: Box::new(GenericAggregator),
    })
}

/// Sobol sensitivity indices from a paired quasi-random mask design.
pub fn sobol(
    n_token_perturbations: usize,
    sampler: SequenceSampler,
    order: SobolOrder,
    seed: u64,
) -> Result<AttributionMethod> {
    Ok(AttributionMethod {
        name: match order {
            SobolOrder::FirstOrder => "sobol",
            SobolOrder::TotalOrder => "sobol-total",
        },
        perturbator: Box::new(SobolMaskPerturbator::new(
            MaskApplier::new(0),
            n_token_perturbations,
            sampler,
            order,
            seed,
        )?),
        scoring: ScoringRule::TargetedLogits,
        aggregator: Box::new(SobolAggregator::new(n_token_perturbations)?),
    })
}

/// Gradient magnitudes averaged along a straight path to a baseline.
pub fn linear_interpolation(
    n_samples: usize,
    baseline: BaselineSpec,
) -> Result<AttributionMethod> {
    Ok(AttributionMethod {
        name: "linear-interpolation",
        perturbator: Box::new(LinearInterpolationPerturbator::new(n_samples, baseline)?),
        scoring: ScoringRule::Gradients,
        aggregator: Box::new(MeanAggregator),
    })
}

/// Gradient magnitudes averaged under isotropic embedding noise.
pub fn gaussian_noise(
    n_perturbations: usize,
    sigma: f64,
    seed: u64,
) -> Result<AttributionMethod> {
    Ok(AttributionMethod {
        name: "gaussian-noise",
        perturbator: Box::new(GaussianNoisePerturbator::new(n_perturbations, sigma, seed)?),
        scoring: ScoringRule::Gradients,
        aggregator: Box::new(MeanAggregator),
    })
}

/// Resolve a method from its command-line name with default settings.
pub fn by_name(name: &str, seed: u64) -> Result<AttributionMethod> {
    match name {
        "occlusion" => Ok(occlusion()),
        "random" | "random-masking" => random_masking(
            DEFAULT_N_PERTURBATIONS,
            DEFAULT_PERTURB_PROBABILITY,
            seed,
        ),
        "sobol" => sobol(
            DEFAULT_N_TOKEN_PERTURBATIONS,
            SequenceSampler::Sobol,
            SobolOrder::FirstOrder,
            seed,
        ),
        "sobol-total" => sobol(
            DEFAULT_N_TOKEN_PERTURBATIONS,
            SequenceSampler::Sobol,
            SobolOrder::TotalOrder,
            seed,
        ),
        "interpolation" | "linear-interpolation" => {
            linear_interpolation(DEFAULT_N_PERTURBATIONS, BaselineSpec::Zero)
        }
        "noise" | "gaussian-noise" => {
            gaussian_noise(DEFAULT_N_PERTURBATIONS, DEFAULT_NOISE_SIGMA, seed)
        }
        other => bail!(
            "unknown attribution method {other:?}, expected one of occlusion, \
             random-masking, sobol, sobol-total, linear-interpolation, gaussian-noise"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::ModelInput;
    use candle_core::Device;

    #[test]
    fn test_by_name_covers_documented_methods() {
        for (name, expected) in [
            ("occlusion", "occlusion"),
            ("random", "random-masking"),
            ("random-masking", "random-masking"),
            ("sobol", "sobol"),
            ("sobol-total", "sobol-total"),
            ("interpolation", "linear-interpolation"),
            ("noise", "gaussian-noise"),
        ] {
            let method = by_name(name, 0).unwrap();
            assert_eq!(method.name, expected);
        }
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let err = by_name("lime", 0).unwrap_err();
        assert!(err.to_string().contains("unknown attribution method"));
    }

    #[test]
    fn test_default_random_masking_variant_count() {
        let method = by_name("random", 1).unwrap();
        let input = ModelInput::from_ids(&[1, 2, 3], &Device::Cpu).unwrap();
        let units: Vec<Vec<usize>> = (0..3).map(|i| vec![i]).collect();
        let (batch, mask) = method.perturbator.perturb(&input, &units).unwrap();
        assert_eq!(batch.batch_size().unwrap(), DEFAULT_N_PERTURBATIONS);
        assert_eq!(
            mask.unwrap().dims(),
            &[DEFAULT_N_PERTURBATIONS, 3]
        );
    }

    #[test]
    fn test_gradient_methods_require_embeddings() {
        let interpolation = by_name("interpolation", 0).unwrap();
        assert!(interpolation.perturbator.requires_embeddings());
        assert_eq!(interpolation.scoring, ScoringRule::Gradients);
        let noise = by_name("noise", 0).unwrap();
        assert!(noise.perturbator.requires_embeddings());
        let occlusion = by_name("occlusion", 0).unwrap();
        assert!(!occlusion.perturbator.requires_embeddings());
        assert_eq!(occlusion.scoring, ScoringRule::TargetedLogits);
    }
}
