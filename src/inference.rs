//! Batched inference scoring over perturbed inputs
//!
//! [`InferenceWrapper`] drives the wrapped model over perturbation batches:
//! it chunks variant rows to the configured batch size, normalizes target
//! tensors, gathers targeted logits for classification and generation, and
//! computes gradient magnitudes of the targeted logits with respect to input
//! embeddings. Chunking is a throughput knob only; outputs are identical for
//! any batch size.
//!
//! ## Targets
//!
//! Target tensors are broadcast-normalized: a scalar is promoted to one
//! dimension, a 1-D target of length `t` is repeated across the batch, a 2-D
//! target with leading dimension 1 likewise. Any other leading-dimension
//! disagreement is a shape error and ranks above 2 are dimensionality errors.

use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::errors::ExplanationError;
use crate::inputs::{InputContent, ModelInput};
use crate::model::{pad_and_stack_ids, ForwardInput, LanguageModel, PaddingSide, TaskKind};

/// Post-processing applied to raw model logits before target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    Logits,
    Softmax,
    LogSoftmax,
}

impl InferenceMode {
    pub fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        match self {
            InferenceMode::Logits => Ok(logits.clone()),
            InferenceMode::Softmax => Ok(ops::softmax(logits, D::Minus1)?),
            InferenceMode::LogSoftmax => Ok(ops::log_softmax(logits, D::Minus1)?),
        }
    }
}

/// Broadcast-normalize a target tensor against a batch of `batch` rows,
/// returning a U32 tensor of shape `(batch, t)`.
pub fn normalize_targets(targets: &Tensor, batch: usize) -> Result<Tensor> {
    let targets = targets.to_dtype(DType::U32)?;
    let normalized = match targets.rank() {
        0 => targets.reshape((1, 1))?.expand((batch, 1))?,
        1 => {
            let t = targets.dim(0)?;
            targets.reshape((1, t))?.expand((batch, t))?
        }
        2 => {
            let (leading, t) = targets.dims2()?;
            if leading == batch {
                targets
            } else if leading == 1 {
                targets.expand((batch, t))?
            } else {
                return Err(ExplanationError::ShapeMismatch(format!(
                    "target batch {leading} does not match input batch {batch}"
                ))
                .into());
            }
        }
        rank => return Err(ExplanationError::DimensionalityError { rank }.into()),
    };
    Ok(normalized.contiguous()?)
}

/// Scoring front-end for one wrapped model.
pub struct InferenceWrapper<'m> {
    model: &'m dyn LanguageModel,
    task: TaskKind,
    batch_size: usize,
    mode: InferenceMode,
}

impl<'m> InferenceWrapper<'m> {
    pub fn new(
        model: &'m dyn LanguageModel,
        task: TaskKind,
        batch_size: usize,
        mode: InferenceMode,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        Ok(Self {
            model,
            task,
            batch_size,
            mode,
        })
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    fn forward_rows(&self, content: &InputContent, attention: &Tensor) -> Result<Tensor> {
        let input = match content {
            InputContent::Ids(ids) => ForwardInput::Ids(ids),
            InputContent::Embeds(embeds) => ForwardInput::Embeds(embeds),
        };
        self.model.forward(input, attention)
    }

    /// Run the model over all variant rows, `batch_size` rows at a time, and
    /// concatenate the outputs in order.
    pub fn logits(&self, input: &ModelInput) -> Result<Tensor> {
        let rows = input.batch_size()?;
        if rows <= self.batch_size {
            return self.mode.apply(&self.forward_rows(&input.content, &input.attention_mask)?);
        }
        let mut outputs = Vec::new();
        let mut start = 0;
        while start < rows {
            let len = self.batch_size.min(rows - start);
            let content = match &input.content {
                InputContent::Ids(t) => InputContent::Ids(t.narrow(0, start, len)?),
                InputContent::Embeds(t) => InputContent::Embeds(t.narrow(0, start, len)?),
            };
            let attention = input.attention_mask.narrow(0, start, len)?;
            outputs.push(self.forward_rows(&content, &attention)?);
            start += len;
        }
        self.mode.apply(&Tensor::cat(&outputs, 0)?)
    }

    /// Lazily score a sequence of inputs, one output per input, in order.
    pub fn logits_many<'a, I>(&'a self, inputs: I) -> impl Iterator<Item = Result<Tensor>> + 'a
    where
        I: Iterator<Item = Result<ModelInput>> + 'a,
    {
        inputs.map(move |input| self.logits(&input?))
    }

    /// Classification scores selected at target class indices.
    ///
    /// Returns shape `(rows, t)` for a target of `t` classes per row.
    pub fn targeted_logits(&self, input: &ModelInput, targets: &Tensor) -> Result<Tensor> {
        let logits = self.logits(input)?;
        let rows = logits.dim(0)?;
        let targets = normalize_targets(targets, rows)?;
        Ok(logits.gather(&targets, D::Minus1)?)
    }

    /// Generation scores for each target token, read at the position that
    /// predicts it.
    ///
    /// `input` holds the perturbed prompts with the continuation appended;
    /// the logit for target token `j` is taken at position
    /// `prompt_len - 1 + j`. Returns shape `(rows, t)`.
    pub fn generation_targeted_logits(
        &self,
        input: &ModelInput,
        targets: &Tensor,
        prompt_len: usize,
    ) -> Result<Tensor> {
        ensure!(prompt_len > 0, "prompt must not be empty");
        let logits = self.logits(input)?;
        let (rows, seq_len, _) = logits.dims3()?;
        let targets = normalize_targets(targets, rows)?;
        let t = targets.dim(1)?;
        ensure!(
            prompt_len - 1 + t <= seq_len,
            "cannot read {t} target positions from sequence length {seq_len} after prompt {prompt_len}"
        );
        let window = logits.narrow(1, prompt_len - 1, t)?.contiguous()?;
        let gathered = window.gather(&targets.unsqueeze(2)?, D::Minus1)?;
        Ok(gathered.squeeze(2)?)
    }

    /// Gradient magnitude of the summed targeted scores with respect to the
    /// input embeddings, one scalar per input position.
    ///
    /// Rows are independent, so the batched gradient equals per-sample
    /// gradients. Ids are embedded lazily here. Returns `(rows, seq_len)`.
    pub fn gradients(&self, input: &ModelInput, targets: &Tensor) -> Result<Tensor> {
        if self.task != TaskKind::Classification {
            return Err(ExplanationError::ModelCapabilityError(
                "gradient scoring requires a sequence-classification model".to_string(),
            )
            .into());
        }
        let embeds = match &input.content {
            InputContent::Embeds(embeds) => embeds.clone(),
            InputContent::Ids(ids) => self.model.embed(ids)?,
        };
        let (rows, seq_len, _) = embeds.dims3()?;
        let targets = normalize_targets(targets, rows)?;
        let var = Var::from_tensor(&embeds)?;
        let mut loss: Option<Tensor> = None;
        let mut start = 0;
        while start < rows {
            let len = self.batch_size.min(rows - start);
            let chunk = var.as_tensor().narrow(0, start, len)?;
            let attention = input.attention_mask.narrow(0, start, len)?;
            let logits = self.model.forward(ForwardInput::Embeds(&chunk), &attention)?;
            let scored = self.mode.apply(&logits)?;
            let chunk_targets = targets.narrow(0, start, len)?;
            let selected = scored.gather(&chunk_targets, D::Minus1)?;
            let chunk_loss = selected.sum_all()?;
            loss = Some(match loss {
                Some(total) => (total + chunk_loss)?,
                None => chunk_loss,
            });
            start += len;
        }
        let loss = loss.ok_or_else(|| anyhow!("empty batch has no gradients"))?;
        let grads = loss.backward()?;
        let grad = grads
            .get(&var)
            .ok_or_else(|| anyhow!("no gradient reached the input embeddings"))?;
        let magnitude = grad.abs()?.mean(D::Minus1)?;
        ensure!(
            magnitude.dims() == [rows, seq_len],
            "unexpected gradient shape {:?}",
            magnitude.dims()
        );
        Ok(magnitude)
    }

    /// Free-running generation from a single-sample prompt.
    ///
    /// Greedy argmax when `temperature` is zero, otherwise seeded sampling
    /// from the temperature-scaled softmax. Returns only the newly generated
    /// ids, stopping at `eos` if given.
    pub fn generate(
        &self,
        input: &ModelInput,
        max_new_tokens: usize,
        eos: Option<u32>,
        temperature: f64,
        seed: u64,
    ) -> Result<Vec<u32>> {
        ensure!(
            input.batch_size()? == 1,
            "generation expects a single-sample prompt"
        );
        ensure!(max_new_tokens > 0, "nothing to generate");
        ensure!(
            temperature.is_finite() && temperature >= 0.0,
            "temperature must be non-negative, got {temperature}"
        );
        let mut current = input.ids()?.to_vec2::<u32>()?.remove(0);
        let device = input.device();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut generated = Vec::with_capacity(max_new_tokens);
        for step in 0..max_new_tokens {
            let len = current.len();
            let ids = Tensor::from_vec(current.clone(), (1, len), device)?;
            let attention = Tensor::from_vec(vec![1u32; len], (1, len), device)?;
            let logits = self.model.forward(ForwardInput::Ids(&ids), &attention)?;
            let last = logits.narrow(1, len - 1, 1)?.squeeze(1)?;
            let next = if temperature > 0.0 {
                let scaled = last.to_dtype(DType::F32)?.affine(1.0 / temperature, 0.0)?;
                let probs = ops::softmax(&scaled, D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
                sample_categorical(&probs, &mut rng)
            } else {
                last.argmax(D::Minus1)?.to_vec1::<u32>()?[0]
            };
            generated.push(next);
            current.push(next);
            if Some(next) == eos {
                debug!("generation hit eos at step {step}");
                break;
            }
        }
        Ok(generated)
    }

    /// Append continuation tokens to every variant row of a perturbed batch.
    ///
    /// Id batches get the raw ids; embedding batches get the tokens' table
    /// embeddings. Appended positions are attended.
    pub fn append_tokens(&self, batch: &ModelInput, tokens: &[u32]) -> Result<ModelInput> {
        ensure!(!tokens.is_empty(), "no tokens to append");
        let rows = batch.batch_size()?;
        let device = batch.device();
        let t = tokens.len();
        let content = match &batch.content {
            InputContent::Ids(ids) => {
                let tail = Tensor::from_vec(tokens.to_vec(), (1, t), device)?
                    .expand((rows, t))?
                    .contiguous()?;
                InputContent::Ids(Tensor::cat(&[ids, &tail], 1)?)
            }
            InputContent::Embeds(embeds) => {
                let token_ids = Tensor::from_vec(tokens.to_vec(), (1, t), device)?;
                let tail = self
                    .model
                    .embed(&token_ids)?
                    .expand((rows, t, embeds.dim(2)?))?
                    .contiguous()?;
                InputContent::Embeds(Tensor::cat(&[embeds, &tail], 1)?)
            }
        };
        let attended = Tensor::from_vec(vec![1u32; t], (1, t), device)?
            .expand((rows, t))?
            .contiguous()?;
        let attention = Tensor::cat(&[&batch.attention_mask, &attended], 1)?;
        ModelInput::from_tensors(content, attention)
    }

    /// Stack ragged id rows with the padding side this task family requires.
    pub fn stack_rows(&self, rows: &[Vec<u32>], pad_id: u32) -> Result<(Tensor, Tensor)> {
        pad_and_stack_ids(
            rows,
            pad_id,
            PaddingSide::for_task(self.task),
            self.model.device(),
        )
    }
}

/// Predicted class per row, shape `(rows,)`.
pub fn argmax_classes(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax(D::Minus1)?)
}

/// Draw one index from a probability vector by inverse CDF.
fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> u32 {
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for (index, p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return index as u32;
        }
    }
    probs.len().saturating_sub(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    /// Mean-pools embeddings and multiplies by a fixed readout matrix.
    struct ToyClassifier {
        table: Tensor,
        readout: Tensor,
        device: Device,
    }

    impl ToyClassifier {
        fn new() -> Self {
            let device = Device::Cpu;
            // Vocabulary of 4, embedding width 2, 3 classes.
            let table = Tensor::from_vec(
                vec![0.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
                (4, 2),
                &device,
            )
            .unwrap();
            let readout = Tensor::from_vec(
                vec![1.0f32, 0.0, 4.0, 0.0, 3.0, 0.0],
                (2, 3),
                &device,
            )
            .unwrap();
            Self {
                table,
                readout,
                device,
            }
        }
    }

    impl LanguageModel for ToyClassifier {
        fn kind(&self) -> &str {
            "ToyForSequenceClassification"
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn embedding_weights(&self) -> Result<Tensor> {
            Ok(self.table.clone())
        }

        fn forward(&self, input: ForwardInput, attention_mask: &Tensor) -> Result<Tensor> {
            let embeds = match input {
                ForwardInput::Ids(ids) => self.embed(ids)?,
                ForwardInput::Embeds(embeds) => embeds.clone(),
            };
            let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
            let summed = embeds.broadcast_mul(&mask)?.sum(1)?;
            let counts = attention_mask
                .to_dtype(DType::F32)?
                .sum_keepdim(1)?
                .clamp(1.0, f32::MAX as f64)?;
            let pooled = summed.broadcast_div(&counts)?;
            Ok(pooled.matmul(&self.readout)?)
        }
    }

    /// Deterministic successor model: position `p` predicts `ids[p] + 1`
    /// modulo the vocabulary, with logit 1 on the predicted token.
    struct ToyLm {
        vocab: usize,
        device: Device,
    }

    impl ToyLm {
        fn new(vocab: usize) -> Self {
            Self {
                vocab,
                device: Device::Cpu,
            }
        }
    }

    impl LanguageModel for ToyLm {
        fn kind(&self) -> &str {
            "ToyLMHeadModel"
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn embedding_weights(&self) -> Result<Tensor> {
            // One-dimensional embeddings holding the token id itself.
            let flat: Vec<f32> = (0..self.vocab).map(|i| i as f32).collect();
            Ok(Tensor::from_vec(flat, (self.vocab, 1), &self.device)?)
        }

        fn forward(&self, input: ForwardInput, _attention_mask: &Tensor) -> Result<Tensor> {
            let ids: Vec<Vec<u32>> = match input {
                ForwardInput::Ids(ids) => ids.to_vec2()?,
                ForwardInput::Embeds(embeds) => embeds
                    .squeeze(2)?
                    .to_vec2::<f32>()?
                    .into_iter()
                    .map(|row| row.into_iter().map(|v| v.round() as u32).collect())
                    .collect(),
            };
            let rows = ids.len();
            let seq_len = ids[0].len();
            let mut flat = vec![0f32; rows * seq_len * self.vocab];
            for (r, row) in ids.iter().enumerate() {
                for (p, &id) in row.iter().enumerate() {
                    let next = (id as usize + 1) % self.vocab;
                    flat[(r * seq_len + p) * self.vocab + next] = 1.0;
                }
            }
            Ok(Tensor::from_vec(
                flat,
                (rows, seq_len, self.vocab),
                &self.device,
            )?)
        }
    }

    fn ids_batch(rows: Vec<Vec<u32>>) -> ModelInput {
        let n = rows.len();
        let len = rows[0].len();
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        let ids = Tensor::from_vec(flat, (n, len), &Device::Cpu).unwrap();
        let attention = Tensor::from_vec(vec![1u32; n * len], (n, len), &Device::Cpu).unwrap();
        ModelInput::from_tensors(InputContent::Ids(ids), attention).unwrap()
    }

    #[test]
    fn test_normalize_targets_shapes() {
        let device = Device::Cpu;
        let scalar = Tensor::new(2u32, &device).unwrap();
        assert_eq!(
            normalize_targets(&scalar, 3).unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![2]; 3]
        );
        let one_d = Tensor::from_vec(vec![1u32, 2], (2,), &device).unwrap();
        assert_eq!(
            normalize_targets(&one_d, 2).unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![1, 2], vec![1, 2]]
        );
        let unit_row = Tensor::from_vec(vec![4u32], (1, 1), &device).unwrap();
        assert_eq!(
            normalize_targets(&unit_row, 2).unwrap().dims(),
            &[2, 1]
        );
        let exact = Tensor::from_vec(vec![1u32, 2, 3, 4], (2, 2), &device).unwrap();
        assert_eq!(
            normalize_targets(&exact, 2).unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![1, 2], vec![3, 4]]
        );
    }

    #[test]
    fn test_normalize_targets_rejects_bad_ranks() {
        let device = Device::Cpu;
        let mismatched = Tensor::from_vec(vec![1u32, 2], (2, 1), &device).unwrap();
        let err = normalize_targets(&mismatched, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplanationError>(),
            Some(ExplanationError::ShapeMismatch(_))
        ));
        let deep = Tensor::zeros((1, 1, 1), DType::U32, &device).unwrap();
        let err = normalize_targets(&deep, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplanationError>(),
            Some(ExplanationError::DimensionalityError { rank: 3 })
        ));
    }

    #[test]
    fn test_targeted_logits_gather() {
        let model = ToyClassifier::new();
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Classification, 8, InferenceMode::Logits)
                .unwrap();
        // Tokens 1 and 2 pool to (0.5, 0.5): logits (0.5, 1.5, 2.0).
        let input = ids_batch(vec![vec![1, 2]]);
        let targets = Tensor::from_vec(vec![2u32, 0], (2,), &Device::Cpu).unwrap();
        let scores = wrapper.targeted_logits(&input, &targets).unwrap();
        assert_eq!(scores.to_vec2::<f32>().unwrap(), vec![vec![2.0, 0.5]]);
    }

    #[test]
    fn test_batch_size_invariance() {
        let model = ToyClassifier::new();
        let input = ids_batch(vec![
            vec![1, 2],
            vec![2, 2],
            vec![3, 0],
            vec![1, 1],
            vec![0, 3],
        ]);
        let mut outputs = Vec::new();
        for batch_size in [1, 2, 64] {
            let wrapper = InferenceWrapper::new(
                &model,
                TaskKind::Classification,
                batch_size,
                InferenceMode::Logits,
            )
            .unwrap();
            outputs.push(wrapper.logits(&input).unwrap().to_vec2::<f32>().unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
    }

    #[test]
    fn test_softmax_mode_normalizes_rows() {
        let model = ToyClassifier::new();
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Classification, 4, InferenceMode::Softmax)
                .unwrap();
        let input = ids_batch(vec![vec![1, 3], vec![2, 2]]);
        let probs = wrapper.logits(&input).unwrap().to_vec2::<f32>().unwrap();
        for row in probs {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| *p > 0.0));
        }
    }

    #[test]
    fn test_gradients_match_mean_pool_analysis() {
        let model = ToyClassifier::new();
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Classification, 2, InferenceMode::Logits)
                .unwrap();
        let input = ids_batch(vec![vec![1, 2, 3], vec![0, 0, 0]]);
        let targets = Tensor::from_vec(vec![2u32, 2], (2,), &Device::Cpu).unwrap();
        let grads = wrapper.gradients(&input, &targets).unwrap();
        // d logit_2 / d e_p = readout[:, 2] / 3 = (4/3, 0); |.| averaged
        // over the embedding dim gives 2/3 at every position of every row.
        let expected = 2.0 / 3.0;
        for row in grads.to_vec2::<f32>().unwrap() {
            for value in row {
                assert!((value - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_gradients_rejected_for_generation() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 2, InferenceMode::Logits)
                .unwrap();
        let input = ids_batch(vec![vec![1, 2]]);
        let targets = Tensor::new(1u32, &Device::Cpu).unwrap();
        let err = wrapper.gradients(&input, &targets).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplanationError>(),
            Some(ExplanationError::ModelCapabilityError(_))
        ));
    }

    #[test]
    fn test_generation_targeted_positions() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 8, InferenceMode::Logits)
                .unwrap();
        // Prompt [3, 5] continued with [6, 7]: position 1 predicts 6 and
        // position 2 predicts 7, so matching targets score 1.
        let input = ids_batch(vec![vec![3, 5, 6, 7]]);
        let targets = Tensor::from_vec(vec![6u32, 7], (2,), &Device::Cpu).unwrap();
        let scores = wrapper
            .generation_targeted_logits(&input, &targets, 2)
            .unwrap();
        assert_eq!(scores.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0]]);
        let wrong = Tensor::from_vec(vec![9u32, 9], (2,), &Device::Cpu).unwrap();
        let scores = wrapper
            .generation_targeted_logits(&input, &wrong, 2)
            .unwrap();
        assert_eq!(scores.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_generate_greedy_and_eos() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 4, InferenceMode::Logits)
                .unwrap();
        let prompt = ids_batch(vec![vec![3]]);
        assert_eq!(
            wrapper.generate(&prompt, 3, None, 0.0, 0).unwrap(),
            vec![4, 5, 6]
        );
        assert_eq!(
            wrapper.generate(&prompt, 5, Some(5), 0.0, 0).unwrap(),
            vec![4, 5]
        );
    }

    #[test]
    fn test_generate_temperature_sampling_is_seeded() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 4, InferenceMode::Logits)
                .unwrap();
        let prompt = ids_batch(vec![vec![3]]);
        let first = wrapper.generate(&prompt, 4, None, 0.7, 11).unwrap();
        let second = wrapper.generate(&prompt, 4, None, 0.7, 11).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|&id| (id as usize) < 10));
        assert!(wrapper.generate(&prompt, 4, None, -1.0, 11).is_err());
    }

    #[test]
    fn test_append_tokens_to_id_batch() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 4, InferenceMode::Logits)
                .unwrap();
        let batch = ids_batch(vec![vec![1, 2], vec![3, 4]]);
        let appended = wrapper.append_tokens(&batch, &[7, 8]).unwrap();
        assert_eq!(
            appended.ids().unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![1, 2, 7, 8], vec![3, 4, 7, 8]]
        );
        assert_eq!(appended.attention_mask.dims(), &[2, 4]);
    }

    #[test]
    fn test_append_tokens_to_embeds_batch() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 4, InferenceMode::Logits)
                .unwrap();
        let embeds =
            Tensor::from_vec(vec![3.0f32, 5.0], (1, 2, 1), &Device::Cpu).unwrap();
        let attention = Tensor::from_vec(vec![1u32, 1], (1, 2), &Device::Cpu).unwrap();
        let batch =
            ModelInput::from_tensors(InputContent::Embeds(embeds), attention).unwrap();
        let appended = wrapper.append_tokens(&batch, &[6]).unwrap();
        let values = appended.embeds().unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(values, vec![vec![vec![3.0], vec![5.0], vec![6.0]]]);
    }

    #[test]
    fn test_stack_rows_pads_left_for_generation() {
        let model = ToyLm::new(10);
        let wrapper =
            InferenceWrapper::new(&model, TaskKind::Generation, 4, InferenceMode::Logits)
                .unwrap();
        let (ids, attention) = wrapper
            .stack_rows(&[vec![5], vec![6, 7]], 0)
            .unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![0, 5], vec![6, 7]]);
        assert_eq!(
            attention.i(0).unwrap().to_vec1::<u32>().unwrap(),
            vec![0, 1]
        );
    }
}
