use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid dimensions {width}x{height}: both must be positive multiples of 16")]
    InvalidDimension { width: usize, height: usize },

    #[error("invalid step count {0}: at least one denoising step is required")]
    InvalidSteps(usize),

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("prompt is {tokens} tokens long, the limit is {max}")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("a reference image was supplied but no identity encoder is configured")]
    IdEncoderUnavailable,

    #[error("identity encoder error: {0}")]
    IdEncoder(String),

    #[error("model evaluation failed: {0}")]
    ModelEvaluation(candle_core::Error),

    #[error("out of memory: {0}")]
    ResourceExhausted(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    /// True for errors caused by the request itself rather than by the backend.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidDimension { .. }
                | Self::InvalidSteps(_)
                | Self::InvalidParameter { .. }
                | Self::PromptTooLong { .. }
                | Self::IdEncoderUnavailable
                | Self::Image(_)
        )
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("out of memory") || lower.contains("out_of_memory") {
            Self::ResourceExhausted(msg)
        } else {
            Self::ModelEvaluation(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_is_resource_exhaustion() {
        let err: PipelineError =
            candle_core::Error::Msg("CUDA_ERROR_OUT_OF_MEMORY: out of memory".into()).into();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));

        let err: PipelineError = candle_core::Error::Msg("shape mismatch".into()).into();
        assert!(matches!(err, PipelineError::ModelEvaluation(_)));
        assert!(!err.is_invalid_request());
    }

    #[test]
    fn request_errors_are_flagged() {
        let err = PipelineError::PromptTooLong { tokens: 300, max: 128 };
        assert!(err.is_invalid_request());
        assert_eq!(err.to_string(), "prompt is 300 tokens long, the limit is 128");
    }
}
