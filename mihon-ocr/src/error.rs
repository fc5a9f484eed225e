/// Failures surfaced by [`crate::OcrEngine`].
///
/// Backend and loader errors are `anyhow` chains internally; they are flattened into the
/// message of the variant that describes which stage failed.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("invalid input image: {0}")]
    InvalidInput(String),

    #[error("failed to initialize OCR engine: {0}")]
    Init(String),

    #[error("OCR engine is already initialized")]
    AlreadyInitialized,

    #[error("OCR engine is not initialized")]
    NotInitialized,

    #[error("failed to allocate tensor buffer: {0}")]
    BufferAllocation(String),

    #[error("text recognition failed: {0}")]
    Recognition(String),
}

impl OcrError {
    pub(crate) fn init(err: impl std::fmt::Display) -> Self {
        Self::Init(format!("{err:#}"))
    }

    pub(crate) fn recognition(err: impl std::fmt::Display) -> Self {
        Self::Recognition(format!("{err:#}"))
    }
}

impl serde::Serialize for OcrError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;
