//! Integration tests for saliency-rs
//!
//! Note: Tests marked with #[ignore] require network access to the
//! Hugging Face Hub. Run them explicitly with: cargo test -- --ignored

use candle_core::Device;
use saliency_rs::demo::{demo_vocabulary, TinyCausalLm, TinyTextClassifier, WhitespaceTokenizer};
use saliency_rs::{
    methods, AttributionExplainer, ExplainerOptions, ExplanationError, GranularityLevel,
    TargetSpec, TokenizerLike,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn classifier_explainer(method_name: &str, options: ExplainerOptions) -> AttributionExplainer {
    let tokenizer = WhitespaceTokenizer::new(&demo_vocabulary());
    let model = TinyTextClassifier::new(tokenizer.vocab_size(), 8, 3, 42, &Device::Cpu).unwrap();
    let method = methods::by_name(method_name, 42).unwrap();
    AttributionExplainer::new(Box::new(model), Box::new(tokenizer), method, options).unwrap()
}

/// Every catalog method runs end-to-end on a classification input
#[test]
fn test_method_catalog_end_to_end() {
    let text = "the movie was great but the ending was terrible";
    for name in [
        "occlusion",
        "random-masking",
        "sobol",
        "sobol-total",
        "linear-interpolation",
        "gaussian-noise",
    ] {
        let explainer = classifier_explainer(name, ExplainerOptions::default());
        let outputs = explainer.explain(text, None).unwrap();
        assert_eq!(outputs.len(), 1, "{name}: one output per input");
        let out = &outputs[0];
        assert_eq!(out.elements.len(), 9, "{name}: one unit per word");
        assert_eq!(out.targets.len(), 1, "{name}: argmax picks one class");
        assert_eq!(out.attributions.len(), 1);
        assert_eq!(out.attributions[0].len(), 9);
        assert!(
            out.attributions[0].iter().all(|v| v.is_finite()),
            "{name}: scores must be finite"
        );
    }
}

/// Batch size only changes inference chunking, never the attributions
#[test]
fn test_batch_size_does_not_change_attributions() {
    let text = "the movie was great but the ending was terrible";
    let small = classifier_explainer(
        "occlusion",
        ExplainerOptions {
            batch_size: 2,
            ..ExplainerOptions::default()
        },
    );
    let large = classifier_explainer(
        "occlusion",
        ExplainerOptions {
            batch_size: 64,
            ..ExplainerOptions::default()
        },
    );
    let a = small.explain(text, None).unwrap();
    let b = large.explain(text, None).unwrap();
    assert_eq!(a[0].targets, b[0].targets);
    for (x, y) in a[0].attributions[0].iter().zip(&b[0].attributions[0]) {
        assert!((x - y).abs() < 1e-6, "{x} vs {y}");
    }
}

/// Sentence granularity groups punctuation-delimited spans into single units
#[test]
fn test_sentence_granularity_groups_whole_sentences() {
    let explainer = classifier_explainer(
        "occlusion",
        ExplainerOptions {
            granularity: GranularityLevel::Sentence,
            ..ExplainerOptions::default()
        },
    );
    let outputs = explainer
        .explain("the movie was great. it was fantastic.", None)
        .unwrap();
    let out = &outputs[0];
    assert_eq!(out.elements.len(), 2);
    assert_eq!(out.attributions[0].len(), 2);
    assert!(out.elements[0].starts_with("the movie was"));
}

/// The replacement token is appended once and lands past the seed vocabulary
#[test]
fn test_replacement_token_is_registered_once() {
    let explainer = classifier_explainer("occlusion", ExplainerOptions::default());
    // 3 reserved ids plus 32 vocabulary words precede the replacement token.
    assert_eq!(explainer.replacement_token_id(), 35);
    assert_eq!(explainer.method_name(), "occlusion");

    let again = classifier_explainer("occlusion", ExplainerOptions::default());
    assert_eq!(again.replacement_token_id(), 35);
}

/// Class targets are a classification concept and are rejected for generation
#[test]
fn test_generation_rejects_class_targets() {
    let tokenizer = WhitespaceTokenizer::new(&demo_vocabulary());
    let model = TinyCausalLm::new(tokenizer.vocab_size(), 8, 42, &Device::Cpu).unwrap();
    let explainer = AttributionExplainer::new(
        Box::new(model),
        Box::new(tokenizer),
        methods::occlusion(),
        ExplainerOptions::default(),
    )
    .unwrap();

    let err = explainer
        .explain("the movie was", Some(TargetSpec::Classes(vec![1])))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExplanationError>(),
        Some(ExplanationError::UnsupportedInputType(_))
    ));
}

/// Forced-continuation attributions stay in place across a JSON round trip
#[test]
fn test_report_round_trips_through_json_file() {
    let tokenizer = WhitespaceTokenizer::new(&demo_vocabulary());
    let model = TinyCausalLm::new(tokenizer.vocab_size(), 8, 42, &Device::Cpu).unwrap();
    let explainer = AttributionExplainer::new(
        Box::new(model),
        Box::new(tokenizer),
        methods::occlusion(),
        ExplainerOptions::default(),
    )
    .unwrap();

    let report = explainer
        .explain_report(
            "the movie",
            Some(TargetSpec::Texts(vec!["was great".to_string()])),
        )
        .unwrap();

    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", serde_json::to_string_pretty(&report).unwrap()).unwrap();

    let loaded: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
    assert_eq!(loaded["method"], "occlusion");
    assert_eq!(loaded["task"], "Generation");
    let rows = loaded["outputs"][0]["attributions"].as_array().unwrap();
    assert_eq!(rows.len(), report.outputs[0].attributions.len());
    for (row, live) in rows.iter().zip(&report.outputs[0].attributions) {
        let row: Vec<f32> = row
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap() as f32)
            .collect();
        assert_eq!(&row, live);
    }
}

/// Network-dependent test: explain through a real Hub tokenizer
#[test]
#[ignore = "requires network access to the Hugging Face Hub"]
fn test_hub_tokenizer_end_to_end() {
    use hf_hub::api::sync::Api;
    use hf_hub::{Repo, RepoType};

    let api = Api::new().unwrap();
    let repo = api.repo(Repo::new("bert-base-uncased".to_string(), RepoType::Model));
    let path = repo.get("tokenizer.json").unwrap();
    let tokenizer = tokenizers::Tokenizer::from_file(&path).unwrap();

    let model =
        TinyTextClassifier::new(tokenizer.get_vocab_size(true), 8, 2, 42, &Device::Cpu).unwrap();
    let explainer = AttributionExplainer::new(
        Box::new(model),
        Box::new(tokenizer),
        methods::occlusion(),
        ExplainerOptions::default(),
    )
    .unwrap();

    let outputs = explainer.explain("the movie was great", None).unwrap();
    let out = &outputs[0];
    assert_eq!(out.elements, vec!["the", "movie", "was", "great"]);
    assert!(out.attributions[0].iter().all(|v| v.is_finite()));
}
