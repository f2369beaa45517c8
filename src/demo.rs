//! Self-contained demo backends
//!
//! Tiny deterministic models and a whitespace tokenizer that exercise the
//! full attribution pipeline without downloading weights. The classifier
//! mean-pools token embeddings through a fixed random readout; the causal
//! model scores each position from a causal prefix mean, so earlier positions
//! never depend on later tokens.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{Encoded, ForwardInput, LanguageModel, TokenizerLike};

const PAD_TOKEN: &str = "[PAD]";
const UNK_TOKEN: &str = "[UNK]";
const EOS_TOKEN: &str = "</s>";

const PAD_ID: u32 = 0;
const UNK_ID: u32 = 1;
const EOS_ID: u32 = 2;

/// Word list shared by the demo tokenizer and the command-line interface.
pub fn demo_vocabulary() -> Vec<&'static str> {
    vec![
        "the", "a", "movie", "film", "book", "was", "is", "really", "great",
        "terrible", "boring", "brilliant", "awful", "fantastic", "acting",
        "plot", "ending", "i", "loved", "hated", "liked", "it", "not", "bad",
        "good", "very", "so", "and", "but", "this", "story", "scene",
    ]
}

/// Fixed-vocabulary whitespace tokenizer.
///
/// Ids 0..3 are reserved for padding, unknown, and end-of-sequence; words get
/// consecutive ids in list order. No special tokens are inserted around the
/// text, so every encoded position is attributable.
#[derive(Debug, Clone)]
pub struct WhitespaceTokenizer {
    vocab: Vec<String>,
    lookup: HashMap<String, u32>,
    special_ids: HashSet<u32>,
}

impl WhitespaceTokenizer {
    pub fn new(words: &[&str]) -> Self {
        let mut vocab: Vec<String> = vec![
            PAD_TOKEN.to_string(),
            UNK_TOKEN.to_string(),
            EOS_TOKEN.to_string(),
        ];
        vocab.extend(words.iter().map(|w| w.to_string()));
        let lookup = vocab
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as u32))
            .collect();
        Self {
            vocab,
            lookup,
            special_ids: HashSet::from([PAD_ID, UNK_ID, EOS_ID]),
        }
    }
}

impl TokenizerLike for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Result<Encoded> {
        let mut ids = Vec::new();
        let mut offsets = Vec::new();
        let mut tokens = Vec::new();
        let mut cursor = 0usize;
        for word in text.split_whitespace() {
            let start = text[cursor..]
                .find(word)
                .map(|p| cursor + p)
                .ok_or_else(|| anyhow!("token {word:?} not found in source text"))?;
            cursor = start + word.len();
            ids.push(*self.lookup.get(word).unwrap_or(&UNK_ID));
            offsets.push((start, cursor));
            tokens.push(word.to_string());
        }
        ensure!(!ids.is_empty(), "cannot encode empty text");
        let n = ids.len();
        Ok(Encoded {
            ids,
            attention_mask: vec![1; n],
            offsets,
            special_tokens_mask: vec![0; n],
            tokens,
            word_ids: (0..n as u32).map(Some).collect(),
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut parts = Vec::with_capacity(ids.len());
        for &id in ids {
            if skip_special_tokens && self.special_ids.contains(&id) {
                continue;
            }
            let token = self
                .vocab
                .get(id as usize)
                .ok_or_else(|| anyhow!("id {id} is outside the vocabulary"))?;
            parts.push(token.as_str());
        }
        Ok(parts.join(" "))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.lookup.get(token).copied()
    }

    fn add_reserved_token(&mut self, token: &str) -> Result<u32> {
        if let Some(id) = self.lookup.get(token) {
            return Ok(*id);
        }
        let id = self.vocab.len() as u32;
        self.vocab.push(token.to_string());
        self.lookup.insert(token.to_string(), id);
        self.special_ids.insert(id);
        Ok(id)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(PAD_ID)
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS_ID)
    }
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let flat: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Ok(Tensor::from_vec(flat, (rows, cols), device)?)
}

/// Grow an embedding table with zero rows, keeping existing rows intact.
fn grow_table(table: &Tensor, new_vocab: usize, device: &Device) -> Result<Option<Tensor>> {
    let (rows, d_model) = table.dims2()?;
    if new_vocab <= rows {
        return Ok(None);
    }
    let extra = Tensor::zeros((new_vocab - rows, d_model), table.dtype(), device)?;
    Ok(Some(Tensor::cat(&[table, &extra], 0)?))
}

/// Mean-pooling classifier over random embeddings, deterministic per seed.
pub struct TinyTextClassifier {
    table: Tensor,
    readout: Tensor,
    device: Device,
}

impl TinyTextClassifier {
    pub fn new(
        vocab_size: usize,
        d_model: usize,
        n_classes: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        ensure!(n_classes > 0, "classifier needs at least one class");
        let mut rng = StdRng::seed_from_u64(seed);
        let table = random_matrix(&mut rng, vocab_size, d_model, device)?;
        let readout = random_matrix(&mut rng, d_model, n_classes, device)?;
        Ok(Self {
            table,
            readout,
            device: device.clone(),
        })
    }

    pub fn n_classes(&self) -> Result<usize> {
        Ok(self.readout.dim(1)?)
    }
}

impl LanguageModel for TinyTextClassifier {
    fn kind(&self) -> &str {
        "TinyForSequenceClassification"
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

    fn resize_token_embeddings(&mut self, new_vocab_size: usize) -> Result<()> {
        if let Some(table) = grow_table(&self.table, new_vocab_size, &self.device)? {
            self.table = table;
        }
        Ok(())
    }
}

/// Causal language model scoring every position from its prefix mean.
pub struct TinyCausalLm {
    table: Tensor,
    device: Device,
}

impl TinyCausalLm {
    pub fn new(vocab_size: usize, d_model: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let table = random_matrix(&mut rng, vocab_size, d_model, device)?;
        Ok(Self {
            table,
            device: device.clone(),
        })
    }
}

impl LanguageModel for TinyCausalLm {
    fn kind(&self) -> &str {
        "TinyLMHeadModel"
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
        let masked = embeds.broadcast_mul(&mask)?;
        // Prefix means keep position p independent of every later token.
        let prefix_sums = masked.cumsum(1)?;
        let counts = mask.cumsum(1)?.clamp(1.0, f32::MAX as f64)?;
        let hidden = prefix_sums.broadcast_div(&counts)?;
        Ok(hidden.broadcast_matmul(&self.table.t()?)?)
    }

    fn resize_token_embeddings(&mut self, new_vocab_size: usize) -> Result<()> {
        if let Some(table) = grow_table(&self.table, new_vocab_size, &self.device)? {
            self.table = table;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ensure_replacement_token, REPLACE_TOKEN};

    fn tokenizer() -> WhitespaceTokenizer {
        WhitespaceTokenizer::new(&demo_vocabulary())
    }

    #[test]
    fn test_tokenizer_roundtrip_and_offsets() {
        let tok = tokenizer();
        let encoded = tok.encode("the movie was great").unwrap();
        assert_eq!(encoded.ids.len(), 4);
        assert_eq!(encoded.offsets, vec![(0, 3), (4, 9), (10, 13), (14, 19)]);
        assert_eq!(encoded.word_ids, vec![Some(0), Some(1), Some(2), Some(3)]);
        let text = tok.decode(&encoded.ids, true).unwrap();
        assert_eq!(text, "the movie was great");
    }

    #[test]
    fn test_tokenizer_unknown_words_map_to_unk() {
        let tok = tokenizer();
        let encoded = tok.encode("the zebra").unwrap();
        assert_eq!(encoded.ids[1], UNK_ID);
        assert_eq!(encoded.tokens[1], "zebra");
    }

    #[test]
    fn test_add_reserved_token_is_idempotent() {
        let mut tok = tokenizer();
        let before = tok.vocab_size();
        let id = tok.add_reserved_token(REPLACE_TOKEN).unwrap();
        assert_eq!(id as usize, before);
        assert_eq!(tok.vocab_size(), before + 1);
        assert_eq!(tok.add_reserved_token(REPLACE_TOKEN).unwrap(), id);
        assert_eq!(tok.vocab_size(), before + 1);
        // Reserved tokens are hidden from skip-special decoding.
        assert_eq!(tok.decode(&[id], true).unwrap(), "");
    }

    #[test]
    fn test_classifier_is_deterministic_per_seed() {
        let device = Device::Cpu;
        let a = TinyTextClassifier::new(16, 4, 3, 7, &device).unwrap();
        let b = TinyTextClassifier::new(16, 4, 3, 7, &device).unwrap();
        let ids = Tensor::from_vec(vec![3u32, 5, 9], (1, 3), &device).unwrap();
        let attention = Tensor::from_vec(vec![1u32, 1, 1], (1, 3), &device).unwrap();
        let la = a.forward(ForwardInput::Ids(&ids), &attention).unwrap();
        let lb = b.forward(ForwardInput::Ids(&ids), &attention).unwrap();
        assert_eq!(la.to_vec2::<f32>().unwrap(), lb.to_vec2::<f32>().unwrap());
        assert_eq!(la.dims(), &[1, 3]);
    }

    #[test]
    fn test_causal_lm_ignores_future_tokens() {
        let device = Device::Cpu;
        let lm = TinyCausalLm::new(16, 4, 11, &device).unwrap();
        let attention = Tensor::from_vec(vec![1u32, 1, 1], (1, 3), &device).unwrap();
        let a = Tensor::from_vec(vec![1u32, 2, 3], (1, 3), &device).unwrap();
        let b = Tensor::from_vec(vec![1u32, 2, 9], (1, 3), &device).unwrap();
        let la = lm
            .forward(ForwardInput::Ids(&a), &attention)
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        let lb = lm
            .forward(ForwardInput::Ids(&b), &attention)
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        assert_eq!(la[0][0], lb[0][0]);
        assert_eq!(la[0][1], lb[0][1]);
        assert_ne!(la[0][2], lb[0][2]);
    }

    #[test]
    fn test_resize_preserves_existing_rows() {
        let device = Device::Cpu;
        let mut model = TinyTextClassifier::new(8, 4, 2, 3, &device).unwrap();
        let before = model.embedding_weights().unwrap().to_vec2::<f32>().unwrap();
        model.resize_token_embeddings(10).unwrap();
        let after = model.embedding_weights().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(after.len(), 10);
        assert_eq!(&after[..8], &before[..]);
        assert_eq!(after[9], vec![0.0; 4]);
    }

    #[test]
    fn test_ensure_replacement_token_grows_the_table() {
        let device = Device::Cpu;
        let mut tok = tokenizer();
        let vocab = tok.vocab_size();
        let mut model = TinyTextClassifier::new(vocab, 4, 2, 3, &device).unwrap();
        let id = ensure_replacement_token(&mut model, &mut tok, REPLACE_TOKEN).unwrap();
        assert_eq!(id as usize, vocab);
        let rows = model.embedding_weights().unwrap().dim(0).unwrap();
        assert_eq!(rows, tok.vocab_size());
    }
}
