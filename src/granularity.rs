//! Granularity resolution and input decomposition
//!
//! Attribution scores are assigned to units: single tokens, pre-tokenization
//! words, sentences, or every token including specials. [`decompose`] maps a
//! single-sample input to ordered groups of token indices at the requested
//! level, and [`unit_labels`] decodes one display string per group.
//!
//! Special tokens are dropped from units at every level except
//! [`GranularityLevel::AllTokens`], which keeps them.

use anyhow::{bail, ensure, Result};
use candle_core::Tensor;

use crate::inputs::ModelInput;
use crate::model::{TaskKind, TokenizerLike};

/// Policy selecting how positions group into attributable units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GranularityLevel {
    Token,
    Word,
    Sentence,
    AllTokens,
    Default,
}

impl GranularityLevel {
    /// Resolve `Default` and task-specific aliases into a concrete level.
    ///
    /// Generation explains every prompt position, so `Token` aliases to
    /// `AllTokens` there.
    pub fn resolve(self, task: TaskKind) -> GranularityLevel {
        match (self, task) {
            (GranularityLevel::Default, TaskKind::Generation) => GranularityLevel::AllTokens,
            (GranularityLevel::Default, _) => GranularityLevel::Token,
            (GranularityLevel::Token, TaskKind::Generation) => GranularityLevel::AllTokens,
            (level, _) => level,
        }
    }

    pub fn keeps_special_tokens(self) -> bool {
        matches!(self, GranularityLevel::AllTokens)
    }
}

fn is_special(input: &ModelInput, position: usize) -> bool {
    input
        .special_tokens_mask
        .as_ref()
        .map(|mask| mask[position] == 1)
        .unwrap_or(false)
}

/// Decompose a single-sample input into ordered groups of token indices.
///
/// Every returned group is non-empty and groups are disjoint and sorted by
/// first position. `Word` requires word-id metadata and `Sentence` requires
/// token texts; text-standardized inputs carry both.
pub fn decompose(input: &ModelInput, level: GranularityLevel) -> Result<Vec<Vec<usize>>> {
    ensure!(
        input.batch_size()? == 1,
        "decomposition expects a single-sample input"
    );
    let seq_len = input.seq_len()?;
    let units: Vec<Vec<usize>> = match level {
        GranularityLevel::AllTokens => (0..seq_len).map(|i| vec![i]).collect(),
        GranularityLevel::Token | GranularityLevel::Default => (0..seq_len)
            .filter(|&i| !is_special(input, i))
            .map(|i| vec![i])
            .collect(),
        GranularityLevel::Word => {
            let Some(word_ids) = input.word_ids.as_ref() else {
                bail!("word granularity requires word id metadata from the tokenizer")
            };
            let mut units: Vec<Vec<usize>> = Vec::new();
            let mut current: Option<u32> = None;
            for i in 0..seq_len {
                if is_special(input, i) {
                    current = None;
                    continue;
                }
                match (word_ids[i], current) {
                    (Some(word), Some(prev)) if word == prev => {
                        if let Some(unit) = units.last_mut() {
                            unit.push(i);
                        }
                    }
                    (word, _) => {
                        units.push(vec![i]);
                        current = word;
                    }
                }
            }
            units
        }
        GranularityLevel::Sentence => {
            let Some(texts) = input.token_texts.as_ref() else {
                bail!("sentence granularity requires token text metadata")
            };
            let mut units: Vec<Vec<usize>> = Vec::new();
            let mut current: Vec<usize> = Vec::new();
            for i in 0..seq_len {
                if is_special(input, i) {
                    continue;
                }
                current.push(i);
                let text = texts[i].trim_end();
                if text.ends_with(['.', '!', '?', '…']) {
                    units.push(std::mem::take(&mut current));
                }
            }
            if !current.is_empty() {
                units.push(current);
            }
            units
        }
    };
    ensure!(
        !units.is_empty(),
        "input has no attributable units at {level:?} granularity"
    );
    Ok(units)
}

/// Decode one display label per unit.
///
/// Prefers decoding the unit's token ids through the tokenizer; falls back to
/// joining raw token piece strings when no ids are available.
pub fn unit_labels(
    units: &[Vec<usize>],
    input: &ModelInput,
    tokenizer: &dyn TokenizerLike,
    level: GranularityLevel,
) -> Result<Vec<String>> {
    let skip_special = !level.keeps_special_tokens();
    if let Some(ids) = input.token_ids.as_ref() {
        return units
            .iter()
            .map(|unit| {
                let unit_ids: Vec<u32> = unit.iter().map(|&i| ids[i]).collect();
                let text = tokenizer.decode(&unit_ids, skip_special)?;
                Ok(text.trim().to_string())
            })
            .collect();
    }
    if let Some(texts) = input.token_texts.as_ref() {
        return Ok(units
            .iter()
            .map(|unit| {
                unit.iter()
                    .map(|&i| texts[i].as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect());
    }
    bail!("cannot decode unit labels without token ids or token texts")
}

/// Expand a per-unit mask row into per-position factors.
///
/// `row` holds one factor per unit; positions outside every unit get 0.
pub fn expand_unit_row(row: &[f32], units: &[Vec<usize>], seq_len: usize) -> Result<Vec<f32>> {
    ensure!(
        row.len() == units.len(),
        "mask row has {} entries but there are {} units",
        row.len(),
        units.len()
    );
    let mut factors = vec![0.0f32; seq_len];
    for (factor, unit) in row.iter().zip(units) {
        for &position in unit {
            ensure!(
                position < seq_len,
                "unit position {position} exceeds sequence length {seq_len}"
            );
            factors[position] = *factor;
        }
    }
    Ok(factors)
}

/// Expand a `(variants, units)` mask into a `(variants, seq_len)` tensor of
/// per-position factors on the mask's device.
pub fn expand_unit_mask(mask: &Tensor, units: &[Vec<usize>], seq_len: usize) -> Result<Tensor> {
    let (variants, n_units) = mask.dims2()?;
    ensure!(
        n_units == units.len(),
        "mask has {n_units} columns but there are {} units",
        units.len()
    );
    let rows = mask.to_vec2::<f32>()?;
    let mut flat = Vec::with_capacity(variants * seq_len);
    for row in &rows {
        flat.extend(expand_unit_row(row, units, seq_len)?);
    }
    Ok(Tensor::from_vec(flat, (variants, seq_len), mask.device())?)
}
