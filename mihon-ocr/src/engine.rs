use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::decoder::{AutoregressiveDecoder, DecodeArena, EmbeddingTable, StopReason};
use crate::error::{OcrError, Result};
use crate::postprocess::TextPostprocessor;
use crate::preprocess::{ImagePreprocessor, ImageTensor};
use crate::runtime::{
    Accelerator, AcceleratorNegotiator, Accelerators, CompiledModel, ModelBuffers, ModelCompiler,
    NegotiatedModels, TensorBuffer, buffer_element_count, create_buffers,
};
use crate::vocab::{Vocabulary, VocabularyDecoder};

/// Result of one recognition call with the decoder's bookkeeping attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReport {
    pub text: String,
    /// Generated ids, starting with the start token and excluding the end token.
    pub tokens: Vec<u32>,
    pub stop: StopReason,
    pub steps: usize,
    pub encoder_time: Duration,
    pub decoder_time: Duration,
}

/// Everything that exists between `initialize` and `close`.
struct Session {
    encoder: Box<dyn CompiledModel>,
    decoder: Box<dyn CompiledModel>,
    encoder_buffers: ModelBuffers,
    decoder_buffers: ModelBuffers,
    embeddings: EmbeddingTable,
    arena: DecodeArena,
    accelerators: Accelerators,
}

impl Session {
    /// Runs the encoder on `pixels` and leaves its hidden state in the arena.
    fn encode(&mut self, pixels: &[f32]) -> anyhow::Result<Duration> {
        let started = Instant::now();
        self.encoder_buffers
            .inputs
            .first_mut()
            .context("encoder has no input")?
            .write(pixels)
            .context("failed to write encoder input")?;
        self.encoder
            .run(&self.encoder_buffers.inputs, &mut self.encoder_buffers.outputs)
            .context("failed to run encoder")?;
        self.encoder_buffers
            .outputs
            .first()
            .context("encoder has no output")?
            .read(self.arena.hidden_state_mut())
            .context("failed to read encoder hidden states")?;
        Ok(started.elapsed())
    }
}

/// Japanese text-line recognizer over a ViT encoder and an autoregressive BERT decoder.
///
/// All public methods take the same lock for their entire body, so concurrent callers are
/// serialized and never observe each other's scratch state.
pub struct OcrEngine {
    config: EngineConfig,
    compiler: Box<dyn ModelCompiler>,
    preprocessor: ImagePreprocessor,
    decoder: AutoregressiveDecoder,
    vocabulary: VocabularyDecoder,
    postprocessor: TextPostprocessor,
    session: Mutex<Option<Session>>,
}

impl OcrEngine {
    pub fn new(
        config: EngineConfig,
        compiler: impl ModelCompiler + 'static,
        vocabulary: Vocabulary,
    ) -> Self {
        Self {
            preprocessor: ImagePreprocessor::from_config(&config),
            decoder: AutoregressiveDecoder::from_config(&config),
            vocabulary: VocabularyDecoder::new(vocabulary, config.special_token_threshold),
            postprocessor: TextPostprocessor,
            compiler: Box::new(compiler),
            session: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles both models, allocates their buffers, loads the embedding table and runs one
    /// warmup inference on a blank image.
    #[instrument(level = "info", skip_all)]
    pub fn initialize(
        &self,
        encoder_bytes: &[u8],
        decoder_bytes: &[u8],
        embedding_bytes: &[u8],
    ) -> Result<()> {
        let mut state = self.lock();
        if state.is_some() {
            return Err(OcrError::AlreadyInitialized);
        }
        self.config.validate().map_err(OcrError::init)?;

        let started = Instant::now();
        let NegotiatedModels {
            encoder,
            decoder,
            accelerators,
        } = AcceleratorNegotiator::new(
            self.compiler.as_ref(),
            self.config.policy,
            self.config.half_precision,
        )
        .compile(encoder_bytes, decoder_bytes)?;

        let encoder_buffers = create_buffers(encoder.as_ref())?;
        let decoder_buffers = create_buffers(decoder.as_ref())?;
        let (hidden_len, logits_len) = self.check_buffers(&encoder_buffers, &decoder_buffers)?;

        let embeddings = EmbeddingTable::from_bytes(embedding_bytes, self.config.hidden_size)
            .map_err(OcrError::init)?;
        if embeddings.rows() != self.config.vocab_size {
            warn!(
                "embedding table has {} rows for a vocabulary of {}",
                embeddings.rows(),
                self.config.vocab_size
            );
        }

        let mut session = Session {
            encoder,
            decoder,
            encoder_buffers,
            decoder_buffers,
            embeddings,
            arena: DecodeArena::new(&self.config, hidden_len, logits_len),
            accelerators,
        };
        self.warmup(&mut session)
            .map_err(|err| OcrError::Init(format!("warmup failed: {err:#}")))?;

        info!(
            "OCR engine ready (encoder/decoder: {}) in {:?}",
            session.accelerators,
            started.elapsed()
        );
        *state = Some(session);
        Ok(())
    }

    pub fn recognize(&self, image: &DynamicImage) -> Result<String> {
        self.recognize_detailed(image).map(|report| report.text)
    }

    #[instrument(level = "info", skip_all)]
    pub fn recognize_detailed(&self, image: &DynamicImage) -> Result<RecognitionReport> {
        let mut state = self.lock();
        let session = state.as_mut().ok_or(OcrError::NotInitialized)?;

        let tensor = self.preprocessor.preprocess(image)?;
        let encoder_time = session
            .encode(tensor.as_slice())
            .map_err(OcrError::recognition)?;

        let outcome = self.decoder.decode(
            session.decoder.as_ref(),
            &mut session.decoder_buffers,
            &session.embeddings,
            &mut session.arena,
        );
        let tokens = session.arena.tokens().as_slice().to_vec();
        let text = self
            .postprocessor
            .postprocess(&self.vocabulary.decode(&tokens));

        debug!(
            "encoder {encoder_time:?}, decoder {:?} over {} steps, stop {:?}",
            outcome.decoder_time, outcome.steps, outcome.stop
        );
        self.check_latency(session.accelerators, encoder_time, outcome.decoder_time);

        Ok(RecognitionReport {
            text,
            tokens,
            stop: outcome.stop,
            steps: outcome.steps,
            encoder_time,
            decoder_time: outcome.decoder_time,
        })
    }

    /// Releases models and buffers. Safe to call repeatedly; `initialize` may follow.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!("OCR engine closed");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    pub fn accelerators(&self) -> Option<Accelerators> {
        self.lock().as_ref().map(|session| session.accelerators)
    }

    pub fn is_using_gpu(&self) -> bool {
        self.accelerators()
            .is_some_and(|accelerators| accelerators.is_using_gpu())
    }

    // Every call resets the arena before use, so state behind a poisoned lock is still valid.
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the hidden-state and logits element counts the arena must hold.
    fn check_buffers(
        &self,
        encoder: &ModelBuffers,
        decoder: &ModelBuffers,
    ) -> Result<(usize, usize)> {
        let max_len = self.config.max_sequence_length;
        let image_len = self.config.image_tensor_len();
        let encoder_input = buffer_len(encoder.input(0), "encoder input", 0)?;
        if encoder_input != image_len {
            return Err(OcrError::Init(format!(
                "encoder input holds {encoder_input} floats, images have {image_len}"
            )));
        }

        let hidden_len = buffer_len(encoder.output(0), "encoder output", 0)?;
        let decoder_hidden = buffer_len(decoder.input(0), "decoder input", 0)?;
        if decoder_hidden != hidden_len {
            return Err(OcrError::Init(format!(
                "decoder hidden-state input holds {decoder_hidden} floats, encoder produces {hidden_len}"
            )));
        }

        let mask_len = buffer_len(decoder.input(1), "decoder input", 1)?;
        if mask_len != max_len {
            return Err(OcrError::Init(format!(
                "decoder attention mask holds {mask_len} floats, sequences have {max_len} positions"
            )));
        }
        let embeddings_len = buffer_len(decoder.input(2), "decoder input", 2)?;
        let expected = max_len * self.config.hidden_size;
        if embeddings_len != expected {
            return Err(OcrError::Init(format!(
                "decoder input embeddings hold {embeddings_len} floats, expected {max_len} x {}",
                self.config.hidden_size
            )));
        }

        let logits_len = buffer_len(decoder.output(0), "decoder output", 0)?;
        let needed = self.config.vocab_size;
        if logits_len < needed {
            return Err(OcrError::Init(format!(
                "decoder logits hold {logits_len} floats, one position needs {needed}"
            )));
        }
        Ok((hidden_len, logits_len))
    }

    #[instrument(level = "info", skip_all)]
    fn warmup(&self, session: &mut Session) -> anyhow::Result<()> {
        let blank = ImageTensor::zeros(self.preprocessor.side());
        let encoder_time = session.encode(blank.as_slice())?;

        let started = Instant::now();
        let token = self.decoder.warmup(
            session.decoder.as_ref(),
            &mut session.decoder_buffers,
            &session.embeddings,
            &mut session.arena,
        )?;
        info!(
            "warmup: encoder {encoder_time:?}, first decoder step {:?} (token {token})",
            started.elapsed()
        );
        Ok(())
    }

    fn check_latency(&self, accelerators: Accelerators, encoder: Duration, decoder: Duration) {
        let budget = Duration::from_millis(self.config.latency_budget_ms);
        if accelerators.encoder == Accelerator::Gpu && encoder > budget {
            warn!("GPU encoder took {encoder:?}, budget is {budget:?}");
        }
        if accelerators.decoder == Accelerator::Gpu && decoder > budget {
            warn!("GPU decoder took {decoder:?}, budget is {budget:?}");
        }
    }
}

fn buffer_len(buffer: Option<&TensorBuffer>, kind: &str, index: usize) -> Result<usize> {
    buffer
        .map(buffer_element_count)
        .ok_or_else(|| OcrError::Init(format!("{kind} {index} is missing")))
}

impl Drop for OcrEngine {
    fn drop(&mut self) {
        self.close();
    }
}
