//! Model and tokenizer collaborator traits
//!
//! The predictive model and the tokenizer are external collaborators: the
//! attribution pipeline never loads weights or vocabularies itself and only
//! relies on the narrow capabilities below. Any classifier or causal LM that
//! can embed ids, run a forward pass, and report its kind string plugs in.
//!
//! ## Task classification
//!
//! The task family is decided once, from the model's kind string suffix
//! (`…ForSequenceClassification` vs `…ForCausalLM`/`…LMHeadModel`), by the
//! pure function [`classify_task`]. Unrecognized kinds are rejected at
//! explainer construction with a `ModelCapabilityError`.

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Tensor};
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info};

use crate::errors::ExplanationError;

/// Task family of a wrapped model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Classification,
    Generation,
    Unsupported,
}

/// Decide the task family from a model kind string.
///
/// Matches the naming convention of transformer checkpoints:
/// `BertForSequenceClassification`, `GPT2LMHeadModel`, `LlamaForCausalLM`.
pub fn task_kind_of(kind: &str) -> TaskKind {
    if kind.ends_with("ForSequenceClassification") {
        TaskKind::Classification
    } else if kind.ends_with("ForCausalLM") || kind.ends_with("LMHeadModel") {
        TaskKind::Generation
    } else {
        TaskKind::Unsupported
    }
}

/// Pure task-classification step of the explainer factory.
pub fn classify_task(model: &dyn LanguageModel) -> TaskKind {
    task_kind_of(model.kind())
}

/// Forward-pass input: raw token ids or pre-computed embeddings.
#[derive(Debug, Clone, Copy)]
pub enum ForwardInput<'a> {
    /// Token ids, shape `(batch, seq_len)`, dtype U32.
    Ids(&'a Tensor),
    /// Input embeddings, shape `(batch, seq_len, d_model)`.
    Embeds(&'a Tensor),
}

/// Capability trait for the wrapped predictive model.
///
/// Classification models return logits of shape `(batch, n_classes)`;
/// generation models return `(batch, seq_len, vocab)`.
pub trait LanguageModel {
    /// Kind string, e.g. `"BertForSequenceClassification"`.
    fn kind(&self) -> &str;

    /// Device the model's parameters live on.
    fn device(&self) -> &Device;

    /// Token embedding lookup table, shape `(vocab, d_model)`.
    fn embedding_weights(&self) -> Result<Tensor>;

    /// Run the model on ids or embeddings.
    fn forward(&self, input: ForwardInput, attention_mask: &Tensor) -> Result<Tensor>;

    /// Grow the embedding table to `new_vocab_size` rows.
    ///
    /// Backends that cannot resize reject the call; the default does.
    fn resize_token_embeddings(&mut self, new_vocab_size: usize) -> Result<()> {
        bail!("resize_token_embeddings to {new_vocab_size} is not supported by this backend")
    }

    /// Embed ids `(batch, seq_len)` into `(batch, seq_len, d_model)` via the
    /// lookup table.
    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let table = self.embedding_weights()?;
        let (batch, seq_len) = ids.dims2()?;
        let d_model = table.dim(1)?;
        let flat = ids.flatten_all()?;
        let rows = table.index_select(&flat, 0)?;
        Ok(rows.reshape((batch, seq_len, d_model))?)
    }
}

/// One encoded text: ids plus the CPU-side metadata the pipeline needs.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Character offset `(start, end)` per token; `(0, 0)` for special tokens.
    pub offsets: Vec<(usize, usize)>,
    /// 1 for special tokens ([CLS], [SEP], padding), 0 otherwise.
    pub special_tokens_mask: Vec<u32>,
    /// Token piece strings, aligned with `ids`.
    pub tokens: Vec<String>,
    /// Pre-tokenization word index per token, `None` for special tokens.
    pub word_ids: Vec<Option<u32>>,
}

/// Capability trait for the wrapped tokenizer.
pub trait TokenizerLike {
    fn encode(&self, text: &str) -> Result<Encoded>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Register a reserved token in the vocabulary and return its id.
    fn add_reserved_token(&mut self, token: &str) -> Result<u32>;

    /// Vocabulary size including added tokens.
    fn vocab_size(&self) -> usize;

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    fn eos_token_id(&self) -> Option<u32> {
        None
    }
}

impl TokenizerLike for Tokenizer {
    fn encode(&self, text: &str) -> Result<Encoded> {
        let encoding = (**self)
            .encode(text, true)
            .map_err(|e| anyhow!("tokenizer encode failed: {e}"))?;
        Ok(Encoded {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
            offsets: encoding.get_offsets().to_vec(),
            special_tokens_mask: encoding.get_special_tokens_mask().to_vec(),
            tokens: encoding.get_tokens().to_vec(),
            word_ids: encoding.get_word_ids().to_vec(),
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("tokenizer decode failed: {e}"))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }

    fn add_reserved_token(&mut self, token: &str) -> Result<u32> {
        (**self).add_tokens(&[AddedToken::from(token.to_string(), false)]);
        (**self)
            .token_to_id(token)
            .ok_or_else(|| anyhow!("token {token:?} missing after add_tokens"))
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.get_padding().map(|p| p.pad_id)
    }
}

/// Default reserved token substituted at masked positions.
pub const REPLACE_TOKEN: &str = "[REPLACE]";

/// Make sure the replacement token exists in the vocabulary and the model's
/// embedding table covers it. Returns the token id.
pub fn ensure_replacement_token(
    model: &mut dyn LanguageModel,
    tokenizer: &mut dyn TokenizerLike,
    token: &str,
) -> Result<u32> {
    if let Some(id) = tokenizer.token_to_id(token) {
        return Ok(id);
    }
    let id = tokenizer.add_reserved_token(token)?;
    let new_vocab = tokenizer.vocab_size();
    let table_rows = model.embedding_weights()?.dim(0)?;
    if new_vocab > table_rows {
        debug!(
            "resizing token embeddings from {} to {} for {}",
            table_rows, new_vocab, token
        );
        model.resize_token_embeddings(new_vocab)?;
    }
    Ok(id)
}

/// Resolve the compute device: CUDA when available unless CPU is forced.
pub fn resolve_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        info!("device: cpu (forced)");
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    match &device {
        Device::Cpu => info!("device: cpu"),
        _ => info!("device: cuda:0"),
    }
    Ok(device)
}

/// Which side padding tokens are added on when stacking unequal-length rows.
///
/// Classification pads right (pooling ignores the tail); generation pads left
/// so the last position stays the newest token for every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    Right,
}

impl PaddingSide {
    /// Policy fixed per task type.
    pub fn for_task(task: TaskKind) -> Self {
        match task {
            TaskKind::Generation => PaddingSide::Left,
            _ => PaddingSide::Right,
        }
    }
}

/// Pad id rows to a common length and stack them into `(n, max_len)` id and
/// attention tensors.
pub fn pad_and_stack_ids(
    rows: &[Vec<u32>],
    pad_id: u32,
    side: PaddingSide,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    anyhow::ensure!(!rows.is_empty(), "cannot stack an empty batch");
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(rows.len() * max_len);
    let mut attention = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        let missing = max_len - row.len();
        match side {
            PaddingSide::Left => {
                ids.extend(std::iter::repeat(pad_id).take(missing));
                attention.extend(std::iter::repeat(0u32).take(missing));
                ids.extend_from_slice(row);
                attention.extend(std::iter::repeat(1u32).take(row.len()));
            }
            PaddingSide::Right => {
                ids.extend_from_slice(row);
                attention.extend(std::iter::repeat(1u32).take(row.len()));
                ids.extend(std::iter::repeat(pad_id).take(missing));
                attention.extend(std::iter::repeat(0u32).take(missing));
            }
        }
    }
    let shape = (rows.len(), max_len);
    let ids = Tensor::from_vec(ids, shape, device)?;
    let attention = Tensor::from_vec(attention, shape, device)?;
    Ok((ids, attention))
}

/// Reject models whose kind string matches no task family.
pub fn require_supported_task(model: &dyn LanguageModel) -> Result<TaskKind> {
    match classify_task(model) {
        TaskKind::Unsupported => Err(ExplanationError::ModelCapabilityError(format!(
            "model kind {:?} is neither a sequence-classification nor a causal-generation model",
            model.kind()
        ))
        .into()),
        task => Ok(task),
    }
}
