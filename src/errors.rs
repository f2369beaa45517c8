//! Typed error taxonomy for the attribution pipeline
//!
//! Every variant is a fail-fast contract error, never a transient condition;
//! nothing here is retried. Errors are raised through [`anyhow::Error`] so
//! call sites keep the usual `.context(...)` composition and callers can
//! `downcast_ref::<ExplanationError>()` to inspect the kind.

use thiserror::Error;

/// Contract violations surfaced by the attribution pipeline.
#[derive(Debug, Error)]
pub enum ExplanationError {
    /// An entry point received an input variant outside its accepted set
    /// (e.g. class targets handed to a generation explainer, or raw ids fed
    /// to an embedding-space perturbation).
    #[error("unsupported input type: {0}")]
    UnsupportedInputType(String),

    /// A tensor disagrees in shape or dtype with the input it must align with.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A target tensor has an unsupported rank (only 0-D, 1-D and 2-D are accepted).
    #[error("unsupported target dimensionality: got rank {rank}, expected 0, 1 or 2")]
    DimensionalityError { rank: usize },

    /// The model kind string matches no recognized task family.
    #[error("model capability error: {0}")]
    ModelCapabilityError(String),

    /// A fan-out cursor requested an index beyond what the producer can supply.
    #[error("exhausted source: requested index {requested}, only {available} items available")]
    ExhaustedSource { requested: usize, available: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ExplanationError::DimensionalityError { rank: 4 };
        assert!(err.to_string().contains("rank 4"));

        let err = ExplanationError::ExhaustedSource {
            requested: 7,
            available: 3,
        };
        assert!(err.to_string().contains("index 7"));
        assert!(err.to_string().contains("3 items"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ExplanationError::ShapeMismatch("baseline".into()).into();
        let kind = err.downcast_ref::<ExplanationError>();
        assert!(matches!(kind, Some(ExplanationError::ShapeMismatch(_))));
    }
}
