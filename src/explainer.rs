//! Attribution explainer orchestration
//!
//! [`AttributionExplainer`] ties the pipeline together: it standardizes the
//! inputs, resolves targets, decomposes each input into attributable units,
//! streams perturbed batches and masks through a shared lazy fan-out, scores
//! variants in bounded batches, and aggregates scores into per-unit
//! attributions.
//!
//! ## Tasks
//!
//! Classification explains the predicted class when no target is given, or
//! the requested classes otherwise. Generation without targets first
//! generates a continuation greedily and attributes each generated token to
//! the prompt units. Generation with explicit targets appends the target
//! tokens to the prompt, perturbs the full sequence in embedding space, and
//! zeroes entries that causality rules out: target token `j` is predicted
//! before any unit starting at or after position `prompt_len + j` enters the
//! model's view.

use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::ExplanationError;
use crate::fanout::split_pairs;
use crate::granularity::{decompose, unit_labels, GranularityLevel};
use crate::inference::{argmax_classes, InferenceMode, InferenceWrapper};
use crate::inputs::{ExplainerInputs, InputContent, ModelInput, TargetSpec};
use crate::methods::{AttributionMethod, ScoringRule};
use crate::model::{
    ensure_replacement_token, require_supported_task, Encoded, LanguageModel, TaskKind,
    TokenizerLike, REPLACE_TOKEN,
};

/// Knobs of an explanation run.
#[derive(Debug, Clone)]
pub struct ExplainerOptions {
    pub granularity: GranularityLevel,
    /// Variant rows scored per forward pass.
    pub batch_size: usize,
    pub mode: InferenceMode,
    /// Continuation budget for generation inputs without targets.
    pub max_new_tokens: usize,
    /// Sampling temperature for free-running generation; zero means greedy.
    pub temperature: f64,
    /// Seed for temperature sampling.
    pub seed: u64,
    pub replace_token: String,
}

impl Default for ExplainerOptions {
    fn default() -> Self {
        Self {
            granularity: GranularityLevel::Default,
            batch_size: 16,
            mode: InferenceMode::Logits,
            max_new_tokens: 16,
            temperature: 0.0,
            seed: 0,
            replace_token: REPLACE_TOKEN.to_string(),
        }
    }
}

/// Attribution result for one input.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionOutput {
    /// Input text decoded from the ids, when available.
    pub text: Option<String>,
    /// Display label per attributable unit.
    pub elements: Vec<String>,
    /// Display label per explained target.
    pub targets: Vec<String>,
    /// One row per target, one column per element.
    pub attributions: Vec<Vec<f32>>,
}

/// Serializable summary of one explain call.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionReport {
    pub method: String,
    pub task: String,
    pub granularity: String,
    pub outputs: Vec<AttributionOutput>,
}

/// Perturbation-based attribution over one wrapped model and tokenizer.
pub struct AttributionExplainer {
    model: Box<dyn LanguageModel>,
    tokenizer: Box<dyn TokenizerLike>,
    task: TaskKind,
    method: AttributionMethod,
    options: ExplainerOptions,
    replace_id: u32,
}

impl AttributionExplainer {
    /// Build an explainer: classify the model's task, then prepare the
    /// replacement token in both the vocabulary and the embedding table.
    pub fn new(
        mut model: Box<dyn LanguageModel>,
        mut tokenizer: Box<dyn TokenizerLike>,
        mut method: AttributionMethod,
        options: ExplainerOptions,
    ) -> Result<Self> {
        ensure!(options.batch_size > 0, "batch size must be positive");
        ensure!(options.max_new_tokens > 0, "max_new_tokens must be positive");
        ensure!(
            options.temperature.is_finite() && options.temperature >= 0.0,
            "temperature must be non-negative"
        );
        let task = require_supported_task(model.as_ref())?;
        let replace_id =
            ensure_replacement_token(model.as_mut(), tokenizer.as_mut(), &options.replace_token)?;
        let ids = Tensor::from_vec(vec![replace_id], (1, 1), model.device())?;
        let replace_embedding = model.embed(&ids)?.flatten_all()?;
        method
            .perturbator
            .set_replacement(replace_id, replace_embedding);
        info!(
            "explainer ready: task {:?}, method {}, replacement token id {}",
            task, method.name, replace_id
        );
        Ok(Self {
            model,
            tokenizer,
            task,
            method,
            options,
            replace_id,
        })
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name
    }

    pub fn replacement_token_id(&self) -> u32 {
        self.replace_id
    }

    /// Explain a batch of inputs, one output per input.
    pub fn explain(
        &self,
        inputs: impl Into<ExplainerInputs>,
        targets: Option<TargetSpec>,
    ) -> Result<Vec<AttributionOutput>> {
        let inputs = inputs
            .into()
            .standardize(self.tokenizer.as_ref(), self.model.device())?;
        info!(
            "explaining {} input(s) with {} at {:?} granularity",
            inputs.len(),
            self.method.name,
            self.options.granularity.resolve(self.task)
        );
        let wrapper = InferenceWrapper::new(
            self.model.as_ref(),
            self.task,
            self.options.batch_size,
            self.options.mode,
        )?;
        match self.task {
            TaskKind::Classification => self.explain_classification(&wrapper, &inputs, targets),
            TaskKind::Generation => self.explain_generation(&wrapper, &inputs, targets),
            TaskKind::Unsupported => Err(ExplanationError::ModelCapabilityError(
                "cannot explain an unsupported model".to_string(),
            )
            .into()),
        }
    }

    /// Explain and wrap the outputs in a serializable report.
    pub fn explain_report(
        &self,
        inputs: impl Into<ExplainerInputs>,
        targets: Option<TargetSpec>,
    ) -> Result<AttributionReport> {
        let outputs = self.explain(inputs, targets)?;
        Ok(AttributionReport {
            method: self.method.name.to_string(),
            task: format!("{:?}", self.task),
            granularity: format!("{:?}", self.options.granularity.resolve(self.task)),
            outputs,
        })
    }

    fn explain_classification(
        &self,
        wrapper: &InferenceWrapper,
        inputs: &[ModelInput],
        targets: Option<TargetSpec>,
    ) -> Result<Vec<AttributionOutput>> {
        let level = self.options.granularity.resolve(self.task);
        let class_targets = self.resolve_class_targets(wrapper, inputs, targets)?;
        let units_per_input: Vec<Vec<Vec<usize>>> = inputs
            .iter()
            .map(|input| decompose(input, level))
            .collect::<Result<_>>()?;
        let prepared = self.prepare_for_perturbation(inputs)?;
        let source = self
            .method
            .perturbator
            .perturb_many(&prepared, &units_per_input);
        let (mut batches, mut masks) = split_pairs(source);
        let mut outputs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let units = &units_per_input[index];
            let target = &class_targets[index];
            let target_values = target
                .to_dtype(DType::U32)?
                .flatten_all()?
                .to_vec1::<u32>()?;
            if matches!(self.method.scoring, ScoringRule::Gradients) {
                ensure!(
                    target_values.len() == 1,
                    "gradient scoring explains a single class per input, got {}",
                    target_values.len()
                );
            }
            let batch = batches.get(index)?;
            let mask = masks.get(index)?;
            debug!(
                "input {index}: {} variant(s) across {} unit(s)",
                batch.batch_size()?,
                units.len()
            );
            let scores = match self.method.scoring {
                ScoringRule::TargetedLogits => wrapper.targeted_logits(&batch, target)?,
                ScoringRule::Gradients => wrapper.gradients(&batch, target)?,
            };
            let aggregated = self.method.aggregator.aggregate(&scores, mask.as_ref())?;
            let attributions = reduce_to_units(&aggregated, units, input.seq_len()?)?;
            let elements = unit_labels(units, input, self.tokenizer.as_ref(), level)?;
            let target_names = target_values
                .iter()
                .map(|class| format!("class {class}"))
                .collect();
            outputs.push(self.assemble(input, elements, target_names, attributions)?);
        }
        Ok(outputs)
    }

    fn explain_generation(
        &self,
        wrapper: &InferenceWrapper,
        inputs: &[ModelInput],
        targets: Option<TargetSpec>,
    ) -> Result<Vec<AttributionOutput>> {
        if matches!(self.method.scoring, ScoringRule::Gradients) {
            return Err(ExplanationError::ModelCapabilityError(
                "gradient scoring requires a sequence-classification model".to_string(),
            )
            .into());
        }
        match targets {
            None => self.explain_generated_continuation(wrapper, inputs),
            Some(spec) => {
                let target_rows = self.resolve_generation_targets(inputs, spec)?;
                self.explain_forced_continuation(wrapper, inputs, &target_rows)
            }
        }
    }

    /// Generate a continuation, then attribute each generated token to the
    /// prompt units by scoring perturbed prompts with the continuation
    /// re-appended.
    fn explain_generated_continuation(
        &self,
        wrapper: &InferenceWrapper,
        inputs: &[ModelInput],
    ) -> Result<Vec<AttributionOutput>> {
        let level = self.options.granularity.resolve(self.task);
        let eos = self.tokenizer.eos_token_id();
        let continuations: Vec<Vec<u32>> = inputs
            .iter()
            .map(|input| {
                wrapper.generate(
                    input,
                    self.options.max_new_tokens,
                    eos,
                    self.options.temperature,
                    self.options.seed,
                )
            })
            .collect::<Result<_>>()?;
        let units_per_input: Vec<Vec<Vec<usize>>> = inputs
            .iter()
            .map(|input| decompose(input, level))
            .collect::<Result<_>>()?;
        let prepared = self.prepare_for_perturbation(inputs)?;
        let source = self
            .method
            .perturbator
            .perturb_many(&prepared, &units_per_input);
        let (mut batches, mut masks) = split_pairs(source);
        let mut outputs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let continuation = &continuations[index];
            debug!(
                "input {index}: explaining {} generated token(s)",
                continuation.len()
            );
            let batch = batches.get(index)?;
            let mask = masks.get(index)?;
            let prompt_len = input.seq_len()?;
            let appended = wrapper.append_tokens(&batch, continuation)?;
            let target = Tensor::from_vec(
                continuation.clone(),
                (continuation.len(),),
                self.model.device(),
            )?;
            let scores = wrapper.generation_targeted_logits(&appended, &target, prompt_len)?;
            let aggregated = self.method.aggregator.aggregate(&scores, mask.as_ref())?;
            let attributions = reduce_to_units(&aggregated, &units_per_input[index], prompt_len)?;
            let elements = unit_labels(
                &units_per_input[index],
                input,
                self.tokenizer.as_ref(),
                level,
            )?;
            let target_names = self.token_labels(continuation)?;
            outputs.push(self.assemble(input, elements, target_names, attributions)?);
        }
        Ok(outputs)
    }

    /// Attribute each forced target token to every unit of the full sequence.
    fn explain_forced_continuation(
        &self,
        wrapper: &InferenceWrapper,
        inputs: &[ModelInput],
        target_rows: &[Vec<u32>],
    ) -> Result<Vec<AttributionOutput>> {
        let level = self.options.granularity.resolve(self.task);
        let mut full_inputs = Vec::with_capacity(inputs.len());
        let mut prompt_lens = Vec::with_capacity(inputs.len());
        for (input, target) in inputs.iter().zip(target_rows) {
            let (full, prompt_len) = self.concat_target(input, target)?;
            full_inputs.push(full);
            prompt_lens.push(prompt_len);
        }
        let units_per_input: Vec<Vec<Vec<usize>>> = full_inputs
            .iter()
            .map(|input| decompose(input, level))
            .collect::<Result<_>>()?;
        // Prompt and target positions are perturbed together, in embedding
        // space so target tokens can be masked like any other unit.
        let prepared: Vec<ModelInput> = full_inputs
            .iter()
            .map(|input| self.to_embedding_space(input))
            .collect::<Result<_>>()?;
        let source = self
            .method
            .perturbator
            .perturb_many(&prepared, &units_per_input);
        let (mut batches, mut masks) = split_pairs(source);
        let mut outputs = Vec::with_capacity(inputs.len());
        for (index, full) in full_inputs.iter().enumerate() {
            let target_ids = &target_rows[index];
            let prompt_len = prompt_lens[index];
            let batch = batches.get(index)?;
            let mask = masks.get(index)?;
            let target = Tensor::from_vec(
                target_ids.clone(),
                (target_ids.len(),),
                self.model.device(),
            )?;
            let scores = wrapper.generation_targeted_logits(&batch, &target, prompt_len)?;
            let aggregated = self.method.aggregator.aggregate(&scores, mask.as_ref())?;
            let mut attributions =
                reduce_to_units(&aggregated, &units_per_input[index], full.seq_len()?)?;
            zero_acausal_entries(&mut attributions, &units_per_input[index], prompt_len);
            let elements = unit_labels(
                &units_per_input[index],
                full,
                self.tokenizer.as_ref(),
                level,
            )?;
            let target_names = self.token_labels(target_ids)?;
            outputs.push(self.assemble(full, elements, target_names, attributions)?);
        }
        Ok(outputs)
    }

    fn resolve_class_targets(
        &self,
        wrapper: &InferenceWrapper,
        inputs: &[ModelInput],
        targets: Option<TargetSpec>,
    ) -> Result<Vec<Tensor>> {
        let device = self.model.device();
        match targets {
            None => inputs
                .iter()
                .map(|input| {
                    let logits = wrapper.logits(input)?;
                    let predicted = argmax_classes(&logits)?;
                    debug!(
                        "no target given, explaining predicted class {:?}",
                        predicted.to_vec1::<u32>()?
                    );
                    Ok(predicted)
                })
                .collect(),
            Some(TargetSpec::Classes(classes)) => broadcast_values(&classes, inputs.len())?
                .into_iter()
                .map(|class| Ok(Tensor::from_vec(vec![class], (1,), device)?))
                .collect(),
            Some(TargetSpec::Tensor(tensor)) => per_input_target_rows(&tensor, inputs.len()),
            Some(TargetSpec::Texts(_)) => Err(ExplanationError::UnsupportedInputType(
                "text targets only apply to generation models".to_string(),
            )
            .into()),
        }
    }

    fn resolve_generation_targets(
        &self,
        inputs: &[ModelInput],
        spec: TargetSpec,
    ) -> Result<Vec<Vec<u32>>> {
        match spec {
            TargetSpec::Texts(texts) => {
                let texts = broadcast_texts(&texts, inputs.len())?;
                texts
                    .iter()
                    .map(|text| {
                        let encoded = self.tokenizer.encode(text)?;
                        let ids: Vec<u32> = encoded
                            .ids
                            .iter()
                            .zip(&encoded.special_tokens_mask)
                            .filter(|(_, &special)| special == 0)
                            .map(|(&id, _)| id)
                            .collect();
                        ensure!(
                            !ids.is_empty(),
                            "target text {text:?} has no attributable tokens"
                        );
                        Ok(ids)
                    })
                    .collect()
            }
            TargetSpec::Tensor(tensor) => {
                let tensor = tensor.to_dtype(DType::U32)?;
                match tensor.rank() {
                    0 => Ok(vec![vec![tensor.to_scalar::<u32>()?]; inputs.len()]),
                    1 => Ok(vec![tensor.to_vec1::<u32>()?; inputs.len()]),
                    2 => {
                        let rows = tensor.to_vec2::<u32>()?;
                        if rows.len() == inputs.len() {
                            Ok(rows)
                        } else if rows.len() == 1 {
                            Ok(vec![rows[0].clone(); inputs.len()])
                        } else {
                            Err(ExplanationError::ShapeMismatch(format!(
                                "target tensor has {} rows for {} inputs",
                                rows.len(),
                                inputs.len()
                            ))
                            .into())
                        }
                    }
                    rank => Err(ExplanationError::DimensionalityError { rank }.into()),
                }
            }
            TargetSpec::Classes(_) => Err(ExplanationError::UnsupportedInputType(
                "class targets apply to sequence-classification models".to_string(),
            )
            .into()),
        }
    }

    /// Convert inputs to embedding space when the strategy needs it.
    fn prepare_for_perturbation(&self, inputs: &[ModelInput]) -> Result<Vec<ModelInput>> {
        if !self.method.perturbator.requires_embeddings() {
            return Ok(inputs.to_vec());
        }
        inputs
            .iter()
            .map(|input| self.to_embedding_space(input))
            .collect()
    }

    fn to_embedding_space(&self, input: &ModelInput) -> Result<ModelInput> {
        if input.is_embeds() {
            return Ok(input.clone());
        }
        let embeds = self.model.embed(input.ids()?)?;
        ModelInput::from_tensors(InputContent::Embeds(embeds), input.attention_mask.clone())
    }

    /// Extend a single-sample prompt with target ids, carrying synthesized
    /// metadata so decomposition and labels cover the full sequence.
    fn concat_target(&self, prompt: &ModelInput, target: &[u32]) -> Result<(ModelInput, usize)> {
        ensure!(!target.is_empty(), "generation target must not be empty");
        let prompt_ids = prompt
            .token_ids
            .clone()
            .ok_or_else(|| anyhow!("prompt is missing token ids"))?;
        let prompt_len = prompt_ids.len();
        let mut ids = prompt_ids;
        ids.extend_from_slice(target);
        let mut tokens = match prompt.token_texts.clone() {
            Some(texts) => texts,
            None => self.token_labels(&ids[..prompt_len])?,
        };
        for &id in target {
            tokens.push(self.tokenizer.decode(&[id], false)?);
        }
        let mut offsets = prompt
            .offsets
            .clone()
            .unwrap_or_else(|| vec![(0, 0); prompt_len]);
        offsets.extend(std::iter::repeat((0, 0)).take(target.len()));
        let mut special = prompt
            .special_tokens_mask
            .clone()
            .unwrap_or_else(|| vec![0; prompt_len]);
        special.extend(std::iter::repeat(0).take(target.len()));
        let mut word_ids = prompt
            .word_ids
            .clone()
            .unwrap_or_else(|| vec![None; prompt_len]);
        word_ids.extend(std::iter::repeat(None).take(target.len()));
        let mut attention = prompt.attention_mask.to_vec2::<u32>()?.remove(0);
        attention.extend(std::iter::repeat(1).take(target.len()));
        let encoded = Encoded {
            ids,
            attention_mask: attention,
            offsets,
            special_tokens_mask: special,
            tokens,
            word_ids,
        };
        Ok((
            ModelInput::from_encoded(&encoded, self.model.device())?,
            prompt_len,
        ))
    }

    fn token_labels(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter()
            .map(|&id| self.tokenizer.decode(&[id], false))
            .collect()
    }

    fn assemble(
        &self,
        input: &ModelInput,
        elements: Vec<String>,
        targets: Vec<String>,
        attributions: Vec<Vec<f32>>,
    ) -> Result<AttributionOutput> {
        ensure!(
            attributions.len() == targets.len(),
            "{} attribution rows for {} targets",
            attributions.len(),
            targets.len()
        );
        for row in &attributions {
            ensure!(
                row.len() == elements.len(),
                "{} attribution columns for {} elements",
                row.len(),
                elements.len()
            );
        }
        let text = match input.token_ids.as_ref() {
            Some(ids) => Some(self.tokenizer.decode(ids, true)?),
            None => None,
        };
        Ok(AttributionOutput {
            text,
            elements,
            targets,
            attributions,
        })
    }
}

/// Map aggregated score columns onto units: identity when the aggregator
/// already produced per-unit columns, summed over each unit's positions when
/// it produced per-position columns.
fn reduce_to_units(
    aggregated: &Tensor,
    units: &[Vec<usize>],
    seq_len: usize,
) -> Result<Vec<Vec<f32>>> {
    let rows = aggregated.to_vec2::<f32>()?;
    let columns = rows.first().map(Vec::len).unwrap_or(0);
    if columns == units.len() {
        return Ok(rows);
    }
    if columns == seq_len {
        return Ok(rows
            .iter()
            .map(|row| {
                units
                    .iter()
                    .map(|unit| unit.iter().map(|&position| row[position]).sum())
                    .collect()
            })
            .collect());
    }
    Err(ExplanationError::ShapeMismatch(format!(
        "aggregated scores have {columns} columns for {} units over {seq_len} positions",
        units.len()
    ))
    .into())
}

/// Zero entries the causal structure rules out for forced targets.
fn zero_acausal_entries(
    attributions: &mut [Vec<f32>],
    units: &[Vec<usize>],
    prompt_len: usize,
) {
    for (j, row) in attributions.iter_mut().enumerate() {
        for (column, unit) in units.iter().enumerate() {
            if let Some(&first) = unit.first() {
                if first >= prompt_len + j {
                    row[column] = 0.0;
                }
            }
        }
    }
}

fn broadcast_values(values: &[u32], n_inputs: usize) -> Result<Vec<u32>> {
    if values.len() == n_inputs {
        return Ok(values.to_vec());
    }
    if values.len() == 1 {
        return Ok(vec![values[0]; n_inputs]);
    }
    Err(ExplanationError::ShapeMismatch(format!(
        "{} target entries for {n_inputs} inputs",
        values.len()
    ))
    .into())
}

fn broadcast_texts(texts: &[String], n_inputs: usize) -> Result<Vec<String>> {
    if texts.len() == n_inputs {
        return Ok(texts.to_vec());
    }
    if texts.len() == 1 {
        return Ok(vec![texts[0].clone(); n_inputs]);
    }
    Err(ExplanationError::ShapeMismatch(format!(
        "{} target texts for {n_inputs} inputs",
        texts.len()
    ))
    .into())
}

fn per_input_target_rows(tensor: &Tensor, n_inputs: usize) -> Result<Vec<Tensor>> {
    match tensor.rank() {
        0 | 1 => Ok(vec![tensor.clone(); n_inputs]),
        2 => {
            let (leading, _) = tensor.dims2()?;
            if leading == n_inputs {
                (0..n_inputs)
                    .map(|i| Ok(tensor.narrow(0, i, 1)?))
                    .collect()
            } else if leading == 1 {
                Ok(vec![tensor.clone(); n_inputs])
            } else {
                Err(ExplanationError::ShapeMismatch(format!(
                    "target tensor has {leading} rows for {n_inputs} inputs"
                ))
                .into())
            }
        }
        rank => Err(ExplanationError::DimensionalityError { rank }.into()),
    }
}
