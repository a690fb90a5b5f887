use thiserror::Error;

/// Job-level failures. These abort the whole job with no partial output.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Invalid archive: {0}")]
    Archive(String),
}

impl JobError {
    pub(crate) fn input(message: impl Into<String>) -> Self {
        JobError::Input(message.into())
    }

    pub(crate) fn archive(message: impl Into<String>) -> Self {
        JobError::Archive(message.into())
    }
}

/// Per-image decode failures. Recorded as an error marker, the job continues.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unrecognized image format")]
    UnknownFormat,

    #[error("Corrupt image data: {0}")]
    Corrupt(String),

    #[error("Unsupported image: {0}")]
    Unsupported(String),
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => match e.kind() {
                image::error::UnsupportedErrorKind::Format(image::error::ImageFormatHint::Unknown) => {
                    DecodeError::UnknownFormat
                }
                _ => DecodeError::Unsupported(e.to_string()),
            },
            other => DecodeError::Corrupt(other.to_string()),
        }
    }
}

/// Failures reported by a caption generator.
#[derive(Error, Debug, Clone)]
pub enum GenerationError {
    /// The accelerator ran out of memory. Triggers the per-image fallback.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cannot connect to inference engine at {0}: {1}")]
    Connection(String, String),

    #[error("Inference engine returned HTTP {0}: {1}")]
    Engine(u16, String),

    #[error("Invalid response from inference engine: {0}")]
    InvalidResponse(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Inference engine returned empty caption")]
    EmptyCaption,

    #[error("{0}")]
    Other(String),
}

impl GenerationError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, GenerationError::ResourceExhausted(_))
    }
}

/// Invalid worker configuration (bad environment values).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}
