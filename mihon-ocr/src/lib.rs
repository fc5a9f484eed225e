//! On-device recognition of Japanese manga text lines.
//!
//! An [`OcrEngine`] preprocesses a cropped text image, encodes it once with a vision
//! transformer, then greedily decodes tokens with a BERT decoder until the end token or the
//! length cap. Models are compiled through the [`runtime::ModelCompiler`] seam; the bundled
//! [`runtime::candle::CandleCompiler`] runs them with candle on CUDA, Metal or the CPU.

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod postprocess;
pub mod preprocess;
pub mod runtime;
pub mod vocab;

pub use config::{AcceleratorPolicy, EngineConfig};
pub use decoder::{EmbeddingTable, StopReason};
pub use engine::{OcrEngine, RecognitionReport};
pub use error::{OcrError, Result};
pub use postprocess::TextPostprocessor;
pub use preprocess::{ImagePreprocessor, ImageTensor};
pub use runtime::{Accelerator, Accelerators};
pub use vocab::{Vocabulary, VocabularyDecoder};
