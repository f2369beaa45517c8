// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `mask`/`masks`
#![allow(clippy::module_name_repetitions)] // MaskApplier in perturbation.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! saliency-rs: perturbation-based feature attribution for sequence models
//!
//! Explains which input units drove a prediction by perturbing them and
//! watching the model's targeted outputs move. Works with sequence
//! classifiers and causal generation models over token ids or embeddings.
//!
//! ## Architecture
//!
//! - `model`: Capability traits for the wrapped model and tokenizer
//! - `inputs`: Input standardization into single-sample batches
//! - `granularity`: Token/word/sentence decomposition into attributable units
//! - `perturbation`: Occlusion, random masking, Sobol designs, interpolation, noise
//! - `sampling`: Quasi-random sequence samplers behind the Sobol designs
//! - `inference`: Batched scoring, targeted logits, and input gradients
//! - `aggregation`: Variant scores collapsed into per-unit attributions
//! - `fanout`: Lazy shared fan-out of perturbed batch/mask pair streams
//! - `methods`: Named bundles of perturbation, scoring, and aggregation
//! - `explainer`: Orchestration from raw inputs to attribution outputs
//! - `errors`: Typed error cases surfaced across the pipeline
//! - `demo`: Deterministic tiny backends for tests and the CLI

pub mod aggregation;
pub mod demo;
pub mod errors;
pub mod explainer;
pub mod fanout;
pub mod granularity;
pub mod inference;
pub mod inputs;
pub mod methods;
pub mod model;
pub mod perturbation;
pub mod sampling;

pub use aggregation::{Aggregator, GenericAggregator, MeanAggregator, SobolAggregator};
pub use errors::ExplanationError;
pub use explainer::{
    AttributionExplainer, AttributionOutput, AttributionReport, ExplainerOptions,
};
pub use fanout::split_pairs;
pub use granularity::GranularityLevel;
pub use inference::{InferenceMode, InferenceWrapper};
pub use inputs::{ExplainerInputs, InputContent, ModelInput, TargetSpec};
pub use methods::{AttributionMethod, ScoringRule};
pub use model::{
    classify_task, resolve_device, Encoded, ForwardInput, LanguageModel, PaddingSide, TaskKind,
    TokenizerLike, REPLACE_TOKEN,
};
pub use perturbation::{
    BaselineSpec, GaussianNoisePerturbator, LinearInterpolationPerturbator, MaskApplier,
    OcclusionPerturbator, Perturbator, RandomMaskPerturbator, SobolMaskPerturbator, SobolOrder,
};
pub use sampling::SequenceSampler;
