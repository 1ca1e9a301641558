use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("{0} is not a valid model")]
    UnsupportedModel(String),

    #[error("unsupported precision {0}, expected 16 or 32")]
    UnsupportedPrecision(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dataset split at {path} is malformed (line {line}): {reason}")]
    MalformedSplit {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("special token `{0}` is missing from the tokenizer vocabulary")]
    MissingSpecialToken(&'static str),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("got {ground_truths} ground truths but {predictions} predictions")]
    LengthMismatch {
        ground_truths: usize,
        predictions: usize,
    },

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ChartError>;
