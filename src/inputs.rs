//! Standardized model inputs for the attribution pipeline
//!
//! The explain call accepts raw text, a single encoded input, or batches of
//! either. Everything funnels through [`ExplainerInputs::standardize`] into a
//! list of single-sample [`ModelInput`]s before any perturbation runs, so the
//! rest of the pipeline only ever sees one shape.
//!
//! ## Invariants
//!
//! All tensor fields of one [`ModelInput`] share the same `(batch, seq_len)`
//! leading dimensions. Per-token metadata (offsets, special-token flags, token
//! strings) is only carried on single-sample inputs and is aligned with the
//! sequence dimension. Inputs are never mutated in place: perturbation always
//! builds new batches.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};

use crate::errors::ExplanationError;
use crate::model::{Encoded, TokenizerLike};

/// Tensor payload of a [`ModelInput`].
#[derive(Debug, Clone)]
pub enum InputContent {
    /// Token ids, shape `(batch, seq_len)`, dtype U32.
    Ids(Tensor),
    /// Input embeddings, shape `(batch, seq_len, d_model)`.
    Embeds(Tensor),
}

impl InputContent {
    /// Leading `(batch, seq_len)` dimensions of the payload.
    pub fn batch_and_seq(&self) -> Result<(usize, usize)> {
        match self {
            InputContent::Ids(t) => Ok(t.dims2()?),
            InputContent::Embeds(t) => {
                let (batch, seq_len, _) = t.dims3()?;
                Ok((batch, seq_len))
            }
        }
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            InputContent::Ids(t) => t,
            InputContent::Embeds(t) => t,
        }
    }
}

/// One model input: tensor payload plus the CPU-side metadata the pipeline
/// needs for decomposition and label decoding.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub content: InputContent,
    /// Attention mask, shape `(batch, seq_len)`, 1 for real tokens.
    pub attention_mask: Tensor,
    /// Character span per token, `(0, 0)` for special tokens.
    pub offsets: Option<Vec<(usize, usize)>>,
    /// 1 for special tokens, 0 otherwise.
    pub special_tokens_mask: Option<Vec<u32>>,
    /// Pre-tokenization word index per token, `None` for special tokens.
    pub word_ids: Option<Vec<Option<u32>>>,
    /// Token piece strings, used to decode unit labels.
    pub token_texts: Option<Vec<String>>,
    /// CPU copy of the ids for single-sample id inputs.
    pub token_ids: Option<Vec<u32>>,
}

impl ModelInput {
    /// Build a single-sample input from one tokenizer encoding.
    pub fn from_encoded(encoded: &Encoded, device: &Device) -> Result<Self> {
        let seq_len = encoded.ids.len();
        ensure!(seq_len > 0, "cannot build a model input from an empty encoding");
        let ids = Tensor::from_vec(encoded.ids.clone(), (1, seq_len), device)?;
        let attention_mask =
            Tensor::from_vec(encoded.attention_mask.clone(), (1, seq_len), device)?;
        let input = Self {
            content: InputContent::Ids(ids),
            attention_mask,
            offsets: Some(encoded.offsets.clone()),
            special_tokens_mask: Some(encoded.special_tokens_mask.clone()),
            word_ids: Some(encoded.word_ids.clone()),
            token_texts: Some(encoded.tokens.clone()),
            token_ids: Some(encoded.ids.clone()),
        };
        input.validate()?;
        Ok(input)
    }

    /// Build a single-sample input from raw ids with an all-ones attention
    /// mask and no token metadata.
    pub fn from_ids(ids: &[u32], device: &Device) -> Result<Self> {
        ensure!(!ids.is_empty(), "cannot build a model input from empty ids");
        let seq_len = ids.len();
        let content = Tensor::from_vec(ids.to_vec(), (1, seq_len), device)?;
        let attention_mask = Tensor::from_vec(vec![1u32; seq_len], (1, seq_len), device)?;
        Ok(Self {
            content: InputContent::Ids(content),
            attention_mask,
            offsets: None,
            special_tokens_mask: None,
            word_ids: None,
            token_texts: None,
            token_ids: Some(ids.to_vec()),
        })
    }

    /// Build an input from prepared tensors; metadata starts empty.
    pub fn from_tensors(content: InputContent, attention_mask: Tensor) -> Result<Self> {
        let input = Self {
            content,
            attention_mask,
            offsets: None,
            special_tokens_mask: None,
            word_ids: None,
            token_texts: None,
            token_ids: None,
        };
        input.validate()?;
        Ok(input)
    }

    /// Check the shared-shape and metadata-alignment invariants.
    pub fn validate(&self) -> Result<()> {
        let (batch, seq_len) = self.content.batch_and_seq()?;
        if let InputContent::Ids(ids) = &self.content {
            ensure!(
                ids.dtype() == DType::U32,
                "token ids must be U32, got {:?}",
                ids.dtype()
            );
        }
        let attn_dims = self.attention_mask.dims2()?;
        if attn_dims != (batch, seq_len) {
            return Err(ExplanationError::ShapeMismatch(format!(
                "attention mask is {:?} but content is ({batch}, {seq_len})",
                attn_dims
            ))
            .into());
        }
        if batch > 1 {
            ensure!(
                self.offsets.is_none()
                    && self.special_tokens_mask.is_none()
                    && self.word_ids.is_none()
                    && self.token_texts.is_none()
                    && self.token_ids.is_none(),
                "per-token metadata is only carried on single-sample inputs"
            );
            return Ok(());
        }
        let check = |name: &str, len: Option<usize>| -> Result<()> {
            if let Some(len) = len {
                if len != seq_len {
                    return Err(ExplanationError::ShapeMismatch(format!(
                        "{name} has {len} entries but the sequence length is {seq_len}"
                    ))
                    .into());
                }
            }
            Ok(())
        };
        check("offsets", self.offsets.as_ref().map(Vec::len))?;
        check(
            "special_tokens_mask",
            self.special_tokens_mask.as_ref().map(Vec::len),
        )?;
        check("word_ids", self.word_ids.as_ref().map(Vec::len))?;
        check("token_texts", self.token_texts.as_ref().map(Vec::len))?;
        check("token_ids", self.token_ids.as_ref().map(Vec::len))?;
        Ok(())
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.content.batch_and_seq()?.0)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.content.batch_and_seq()?.1)
    }

    pub fn device(&self) -> &Device {
        self.content.tensor().device()
    }

    pub fn is_embeds(&self) -> bool {
        matches!(self.content, InputContent::Embeds(_))
    }

    /// Token ids payload, rejecting embeddings-only inputs.
    pub fn ids(&self) -> Result<&Tensor> {
        match &self.content {
            InputContent::Ids(t) => Ok(t),
            InputContent::Embeds(_) => Err(ExplanationError::UnsupportedInputType(
                "token ids requested from an embeddings-only input".to_string(),
            )
            .into()),
        }
    }

    /// Embeddings payload, rejecting id-only inputs.
    pub fn embeds(&self) -> Result<&Tensor> {
        match &self.content {
            InputContent::Embeds(t) => Ok(t),
            InputContent::Ids(_) => Err(ExplanationError::UnsupportedInputType(
                "embeddings requested from an ids-only input".to_string(),
            )
            .into()),
        }
    }

    /// Split a batched input into single-sample inputs, one per row.
    ///
    /// Row inputs keep no token metadata except the CPU id copy, which is
    /// re-derived per row for id payloads.
    pub fn split_rows(&self) -> Result<Vec<ModelInput>> {
        let batch = self.batch_size()?;
        if batch == 1 {
            return Ok(vec![self.clone()]);
        }
        let id_rows = match &self.content {
            InputContent::Ids(t) => Some(t.to_vec2::<u32>()?),
            InputContent::Embeds(_) => None,
        };
        let mut rows = Vec::with_capacity(batch);
        for i in 0..batch {
            let content = match &self.content {
                InputContent::Ids(t) => InputContent::Ids(t.narrow(0, i, 1)?.contiguous()?),
                InputContent::Embeds(t) => InputContent::Embeds(t.narrow(0, i, 1)?.contiguous()?),
            };
            let attention_mask = self.attention_mask.narrow(0, i, 1)?.contiguous()?;
            let mut row = Self::from_tensors(content, attention_mask)?;
            if let Some(id_rows) = &id_rows {
                row.token_ids = Some(id_rows[i].clone());
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Move all tensor fields to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let content = match &self.content {
            InputContent::Ids(t) => InputContent::Ids(t.to_device(device)?),
            InputContent::Embeds(t) => InputContent::Embeds(t.to_device(device)?),
        };
        Ok(Self {
            content,
            attention_mask: self.attention_mask.to_device(device)?,
            offsets: self.offsets.clone(),
            special_tokens_mask: self.special_tokens_mask.clone(),
            word_ids: self.word_ids.clone(),
            token_texts: self.token_texts.clone(),
            token_ids: self.token_ids.clone(),
        })
    }
}

/// Accepted shapes of the explain call's `inputs` argument.
///
/// One variant per accepted shape, resolved once at the boundary.
#[derive(Debug, Clone)]
pub enum ExplainerInputs {
    Text(String),
    Texts(Vec<String>),
    Single(ModelInput),
    Many(Vec<ModelInput>),
}

impl ExplainerInputs {
    /// Normalize to one single-sample [`ModelInput`] per element, tokenizing
    /// text and splitting batched tensors.
    pub fn standardize(
        self,
        tokenizer: &dyn TokenizerLike,
        device: &Device,
    ) -> Result<Vec<ModelInput>> {
        match self {
            ExplainerInputs::Text(text) => {
                let encoded = tokenizer.encode(&text)?;
                Ok(vec![ModelInput::from_encoded(&encoded, device)?])
            }
            ExplainerInputs::Texts(texts) => {
                if texts.is_empty() {
                    return Err(ExplanationError::UnsupportedInputType(
                        "empty text batch".to_string(),
                    )
                    .into());
                }
                texts
                    .iter()
                    .map(|text| {
                        let encoded = tokenizer.encode(text)?;
                        ModelInput::from_encoded(&encoded, device)
                    })
                    .collect()
            }
            ExplainerInputs::Single(input) => input.to_device(device)?.split_rows(),
            ExplainerInputs::Many(inputs) => {
                if inputs.is_empty() {
                    return Err(ExplanationError::UnsupportedInputType(
                        "empty input batch".to_string(),
                    )
                    .into());
                }
                let mut rows = Vec::new();
                for input in &inputs {
                    rows.extend(input.to_device(device)?.split_rows()?);
                }
                Ok(rows)
            }
        }
    }
}

impl From<&str> for ExplainerInputs {
    fn from(text: &str) -> Self {
        ExplainerInputs::Text(text.to_string())
    }
}

impl From<String> for ExplainerInputs {
    fn from(text: String) -> Self {
        ExplainerInputs::Text(text)
    }
}

impl From<Vec<String>> for ExplainerInputs {
    fn from(texts: Vec<String>) -> Self {
        ExplainerInputs::Texts(texts)
    }
}

impl From<ModelInput> for ExplainerInputs {
    fn from(input: ModelInput) -> Self {
        ExplainerInputs::Single(input)
    }
}

impl From<Vec<ModelInput>> for ExplainerInputs {
    fn from(inputs: Vec<ModelInput>) -> Self {
        ExplainerInputs::Many(inputs)
    }
}

/// Accepted shapes of the explain call's optional targets.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    /// Class indices, one per input or a single shared index.
    Classes(Vec<u32>),
    /// Raw target tensor, normalized by the inference wrapper.
    Tensor(Tensor),
    /// Text targets for generation models, tokenized before use.
    Texts(Vec<String>),
}
