//! Perturbation strategies
//!
//! Every strategy turns one single-sample input into a batch of perturbed
//! variants plus an optional mask describing which units were altered in each
//! variant. Mask rows align with batch rows; mask columns align with the
//! attribution units the caller decomposed the input into.
//!
//! ## Mask application
//!
//! Mask-driven strategies share one applier. On token ids a mask entry is
//! binarized at 0.5 and masked positions get the replacement token id. On
//! embeddings the mask blends continuously between the original vector and
//! the replacement embedding, which keeps the quasi-random Sobol designs
//! meaningful in embedding space.
//!
//! ## Strategies
//!
//! [`OcclusionPerturbator`] drops one unit per variant, deterministic.
//! [`RandomMaskPerturbator`] draws Bernoulli masks. [`SobolMaskPerturbator`]
//! lays out the paired block design used by the Sobol index estimator.
//! [`LinearInterpolationPerturbator`] walks from the input to a baseline in
//! embedding space and [`GaussianNoisePerturbator`] adds isotropic noise;
//! neither produces a mask.

use std::cell::RefCell;

use anyhow::{bail, ensure, Result};
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::errors::ExplanationError;
use crate::granularity::expand_unit_mask;
use crate::inputs::{InputContent, ModelInput};
use crate::sampling::SequenceSampler;

/// One perturbed batch and the unit mask that produced it, if any.
pub type PerturbedPair = (ModelInput, Option<Tensor>);

/// Common contract of all perturbation strategies.
pub trait Perturbator {
    /// Short name used in logs.
    fn label(&self) -> &'static str;

    /// Perturb one single-sample input into a batch of variants.
    ///
    /// `units` is the granularity decomposition of the input; returned masks
    /// have one column per unit.
    fn perturb(&self, input: &ModelInput, units: &[Vec<usize>]) -> Result<PerturbedPair>;

    /// True when the strategy operates on embeddings rather than token ids.
    fn requires_embeddings(&self) -> bool {
        false
    }

    /// Install the replacement token resolved at explainer construction.
    ///
    /// Strategies that do not mask ignore it.
    fn set_replacement(&mut self, _replace_id: u32, _replace_embedding: Tensor) {}

    /// Apply the strategy to each input independently, lazily and in order.
    fn perturb_many<'a>(
        &'a self,
        inputs: &'a [ModelInput],
        units: &'a [Vec<Vec<usize>>],
    ) -> Box<dyn Iterator<Item = Result<PerturbedPair>> + 'a> {
        Box::new(
            inputs
                .iter()
                .zip(units.iter())
                .map(move |(input, input_units)| self.perturb(input, input_units)),
        )
    }
}

/// Replaces masked content in id or embedding space.
#[derive(Debug, Clone)]
pub struct MaskApplier {
    pub replace_id: u32,
    /// Replacement vector of shape `(d_model,)` for embedding-space inputs.
    pub replace_embedding: Option<Tensor>,
}

impl MaskApplier {
    pub fn new(replace_id: u32) -> Self {
        Self {
            replace_id,
            replace_embedding: None,
        }
    }

    pub fn with_replace_embedding(mut self, embedding: Tensor) -> Self {
        self.replace_embedding = Some(embedding);
        self
    }

    /// Build the perturbed batch described by a `(variants, units)` mask.
    pub fn apply(
        &self,
        input: &ModelInput,
        units: &[Vec<usize>],
        mask: &Tensor,
    ) -> Result<ModelInput> {
        ensure!(
            input.batch_size()? == 1,
            "mask application expects a single-sample input"
        );
        let seq_len = input.seq_len()?;
        let (variants, _) = mask.dims2()?;
        let factors = expand_unit_mask(mask, units, seq_len)?;
        let content = match &input.content {
            InputContent::Ids(ids) => {
                let original = &ids.to_vec2::<u32>()?[0];
                let factor_rows = factors.to_vec2::<f32>()?;
                let mut flat = Vec::with_capacity(variants * seq_len);
                for row in &factor_rows {
                    for (position, &factor) in row.iter().enumerate() {
                        flat.push(if factor >= 0.5 {
                            self.replace_id
                        } else {
                            original[position]
                        });
                    }
                }
                InputContent::Ids(Tensor::from_vec(
                    flat,
                    (variants, seq_len),
                    input.device(),
                )?)
            }
            InputContent::Embeds(embeds) => {
                let Some(replacement) = &self.replace_embedding else {
                    bail!("embedding-space masking requires a replacement embedding")
                };
                let d_model = embeds.dim(2)?;
                ensure!(
                    replacement.dims() == [d_model],
                    "replacement embedding has shape {:?}, expected ({d_model},)",
                    replacement.dims()
                );
                let blend = factors.unsqueeze(2)?;
                let keep = blend.affine(-1.0, 1.0)?;
                let replacement = replacement.reshape((1, 1, d_model))?;
                let perturbed = embeds
                    .broadcast_mul(&keep)?
                    .broadcast_add(&replacement.broadcast_mul(&blend)?)?;
                InputContent::Embeds(perturbed)
            }
        };
        let attention = replicate_attention(input, variants)?;
        ModelInput::from_tensors(content, attention)
    }
}

fn replicate_attention(input: &ModelInput, variants: usize) -> Result<Tensor> {
    let seq_len = input.seq_len()?;
    Ok(input
        .attention_mask
        .expand((variants, seq_len))?
        .contiguous()?)
}

/// Zero row stacked above the `n x n` identity: variant 0 unperturbed,
/// variant `i` masks exactly unit `i - 1`.
pub fn occlusion_mask(n_units: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut flat = vec![0f32; (n_units + 1) * n_units];
    for i in 0..n_units {
        flat[(i + 1) * n_units + i] = 1.0;
    }
    Ok(Tensor::from_vec(flat, (n_units + 1, n_units), device)?)
}

/// Leave-one-unit-out perturbation, `n_units + 1` variants.
#[derive(Debug, Clone)]
pub struct OcclusionPerturbator {
    applier: MaskApplier,
}

impl OcclusionPerturbator {
    pub fn new(applier: MaskApplier) -> Self {
        Self { applier }
    }
}

impl Perturbator for OcclusionPerturbator {
    fn label(&self) -> &'static str {
        "occlusion"
    }

    fn set_replacement(&mut self, replace_id: u32, replace_embedding: Tensor) {
        self.applier.replace_id = replace_id;
        self.applier.replace_embedding = Some(replace_embedding);
    }

    fn perturb(&self, input: &ModelInput, units: &[Vec<usize>]) -> Result<PerturbedPair> {
        let mask = occlusion_mask(units.len(), input.device())?;
        let batch = self.applier.apply(input, units, &mask)?;
        Ok((batch, Some(mask)))
    }
}

/// Independent Bernoulli masking with a fixed number of variants.
#[derive(Debug)]
pub struct RandomMaskPerturbator {
    applier: MaskApplier,
    n_perturbations: usize,
    perturb_probability: f64,
    rng: RefCell<StdRng>,
}

impl RandomMaskPerturbator {
    pub fn new(
        applier: MaskApplier,
        n_perturbations: usize,
        perturb_probability: f64,
        seed: u64,
    ) -> Result<Self> {
        ensure!(n_perturbations > 0, "need at least one perturbation");
        ensure!(
            (0.0..=1.0).contains(&perturb_probability),
            "perturb probability {perturb_probability} is outside [0, 1]"
        );
        Ok(Self {
            applier,
            n_perturbations,
            perturb_probability,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl Perturbator for RandomMaskPerturbator {
    fn label(&self) -> &'static str {
        "random"
    }

    fn set_replacement(&mut self, replace_id: u32, replace_embedding: Tensor) {
        self.applier.replace_id = replace_id;
        self.applier.replace_embedding = Some(replace_embedding);
    }

    fn perturb(&self, input: &ModelInput, units: &[Vec<usize>]) -> Result<PerturbedPair> {
        let n_units = units.len();
        let mut rng = self.rng.borrow_mut();
        let flat: Vec<f32> = (0..self.n_perturbations * n_units)
            .map(|_| {
                if rng.gen_bool(self.perturb_probability) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        drop(rng);
        let mask = Tensor::from_vec(flat, (self.n_perturbations, n_units), input.device())?;
        let batch = self.applier.apply(input, units, &mask)?;
        Ok((batch, Some(mask)))
    }
}

/// Estimation target of the Sobol design: one unit's marginal effect or its
/// combined effect including interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SobolOrder {
    FirstOrder,
    TotalOrder,
}

/// Paired-block quasi-random masking for Sobol index estimation.
///
/// For `k` draws over `l` units the mask has `(l + 1) * k` rows in `l + 1`
/// blocks of `k`. Block 0 is the base design. For first-order estimation,
/// block `i` flips only column `i - 1` to its complement; for total-order
/// estimation block `i` keeps column `i - 1` and flips everything else.
#[derive(Debug, Clone)]
pub struct SobolMaskPerturbator {
    applier: MaskApplier,
    n_token_perturbations: usize,
    sampler: SequenceSampler,
    order: SobolOrder,
    seed: u64,
}

impl SobolMaskPerturbator {
    pub fn new(
        applier: MaskApplier,
        n_token_perturbations: usize,
        sampler: SequenceSampler,
        order: SobolOrder,
        seed: u64,
    ) -> Result<Self> {
        ensure!(
            n_token_perturbations > 0,
            "need at least one draw per block"
        );
        Ok(Self {
            applier,
            n_token_perturbations,
            sampler,
            order,
            seed,
        })
    }

    /// Number of variants produced for `n_units` units.
    pub fn n_variants(&self, n_units: usize) -> usize {
        (n_units + 1) * self.n_token_perturbations
    }

    fn design(&self, n_units: usize) -> Result<Vec<f32>> {
        let k = self.n_token_perturbations;
        let base = self.sampler.sample(k, n_units, self.seed)?;
        let mut flat = Vec::with_capacity((n_units + 1) * k * n_units);
        for row in &base {
            flat.extend_from_slice(row);
        }
        for flipped in 0..n_units {
            for row in &base {
                for (column, &value) in row.iter().enumerate() {
                    let complement = 1.0 - value;
                    let entry = match self.order {
                        SobolOrder::FirstOrder => {
                            if column == flipped {
                                complement
                            } else {
                                value
                            }
                        }
                        SobolOrder::TotalOrder => {
                            if column == flipped {
                                value
                            } else {
                                complement
                            }
                        }
                    };
                    flat.push(entry);
                }
            }
        }
        Ok(flat)
    }
}

impl Perturbator for SobolMaskPerturbator {
    fn label(&self) -> &'static str {
        "sobol"
    }

    fn set_replacement(&mut self, replace_id: u32, replace_embedding: Tensor) {
        self.applier.replace_id = replace_id;
        self.applier.replace_embedding = Some(replace_embedding);
    }

    fn perturb(&self, input: &ModelInput, units: &[Vec<usize>]) -> Result<PerturbedPair> {
        let n_units = units.len();
        let flat = self.design(n_units)?;
        let mask = Tensor::from_vec(
            flat,
            (self.n_variants(n_units), n_units),
            input.device(),
        )?;
        let batch = self.applier.apply(input, units, &mask)?;
        Ok((batch, Some(mask)))
    }
}

/// Baseline of a linear interpolation walk.
#[derive(Debug, Clone)]
pub enum BaselineSpec {
    /// All-zero embeddings.
    Zero,
    /// Constant value broadcast over the input shape.
    Scalar(f64),
    /// Explicit tensor, must match the input's shape and dtype.
    Tensor(Tensor),
}

/// Evenly-spaced walk from the input embeddings to a baseline.
#[derive(Debug, Clone)]
pub struct LinearInterpolationPerturbator {
    n_samples: usize,
    baseline: BaselineSpec,
}

impl LinearInterpolationPerturbator {
    pub fn new(n_samples: usize, baseline: BaselineSpec) -> Result<Self> {
        ensure!(n_samples >= 2, "interpolation needs at least two steps");
        Ok(Self {
            n_samples,
            baseline,
        })
    }

    /// Materialize the baseline as a `(1, seq_len, d_model)` tensor matching
    /// the input embeddings.
    fn baseline_tensor(&self, embeds: &Tensor) -> Result<Tensor> {
        let dims = embeds.dims3()?;
        let shape = (1, dims.1, dims.2);
        match &self.baseline {
            BaselineSpec::Zero => Ok(Tensor::zeros(shape, embeds.dtype(), embeds.device())?),
            BaselineSpec::Scalar(value) => Ok(Tensor::full(
                *value as f32,
                shape,
                embeds.device(),
            )?
            .to_dtype(embeds.dtype())?),
            BaselineSpec::Tensor(tensor) => {
                if tensor.dtype() != embeds.dtype() {
                    return Err(ExplanationError::ShapeMismatch(format!(
                        "baseline dtype {:?} does not match input dtype {:?}",
                        tensor.dtype(),
                        embeds.dtype()
                    ))
                    .into());
                }
                let baseline = if tensor.dims() == [dims.1, dims.2] {
                    tensor.unsqueeze(0)?
                } else if tensor.dims() == [1, dims.1, dims.2] {
                    tensor.clone()
                } else {
                    return Err(ExplanationError::ShapeMismatch(format!(
                        "baseline shape {:?} does not match input shape {:?}",
                        tensor.dims(),
                        embeds.dims()
                    ))
                    .into());
                };
                Ok(baseline.to_device(embeds.device())?)
            }
        }
    }
}

impl Perturbator for LinearInterpolationPerturbator {
    fn label(&self) -> &'static str {
        "interpolation"
    }

    fn requires_embeddings(&self) -> bool {
        true
    }

    fn perturb(&self, input: &ModelInput, _units: &[Vec<usize>]) -> Result<PerturbedPair> {
        ensure!(
            input.batch_size()? == 1,
            "interpolation expects a single-sample input"
        );
        let embeds = input.embeds()?;
        let baseline = self.baseline_tensor(embeds)?;
        let last = (self.n_samples - 1) as f64;
        let mut steps = Vec::with_capacity(self.n_samples);
        for k in 0..self.n_samples {
            let alpha = k as f64 / last;
            let step = embeds
                .affine(1.0 - alpha, 0.0)?
                .broadcast_add(&baseline.affine(alpha, 0.0)?)?;
            steps.push(step.squeeze(0)?);
        }
        let content = InputContent::Embeds(Tensor::stack(&steps, 0)?);
        let attention = replicate_attention(input, self.n_samples)?;
        Ok((ModelInput::from_tensors(content, attention)?, None))
    }
}

/// Isotropic Gaussian noise in embedding space, no mask.
#[derive(Debug)]
pub struct GaussianNoisePerturbator {
    n_perturbations: usize,
    sigma: f64,
    rng: RefCell<StdRng>,
}

impl GaussianNoisePerturbator {
    pub fn new(n_perturbations: usize, sigma: f64, seed: u64) -> Result<Self> {
        ensure!(n_perturbations > 0, "need at least one perturbation");
        ensure!(sigma >= 0.0, "noise level {sigma} must be non-negative");
        Ok(Self {
            n_perturbations,
            sigma,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl Perturbator for GaussianNoisePerturbator {
    fn label(&self) -> &'static str {
        "gaussian-noise"
    }

    fn requires_embeddings(&self) -> bool {
        true
    }

    fn perturb(&self, input: &ModelInput, _units: &[Vec<usize>]) -> Result<PerturbedPair> {
        ensure!(
            input.batch_size()? == 1,
            "noise perturbation expects a single-sample input"
        );
        let embeds = input.embeds()?;
        let (_, seq_len, d_model) = embeds.dims3()?;
        let normal = Normal::new(0.0, self.sigma)
            .map_err(|e| anyhow::anyhow!("invalid noise distribution: {e}"))?;
        let mut rng = self.rng.borrow_mut();
        let flat: Vec<f32> = (0..self.n_perturbations * seq_len * d_model)
            .map(|_| normal.sample(&mut *rng) as f32)
            .collect();
        drop(rng);
        let noise = Tensor::from_vec(
            flat,
            (self.n_perturbations, seq_len, d_model),
            input.device(),
        )?
        .to_dtype(embeds.dtype())?;
        let content = InputContent::Embeds(embeds.broadcast_add(&noise)?);
        let attention = replicate_attention(input, self.n_perturbations)?;
        Ok((ModelInput::from_tensors(content, attention)?, None))
    }
}
