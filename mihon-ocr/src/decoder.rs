use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::runtime::{CompiledModel, ModelBuffers};

const DECODER_HIDDEN_STATES: usize = 0;
const DECODER_ATTENTION_MASK: usize = 1;
const DECODER_INPUT_EMBEDDINGS: usize = 2;
const DECODER_LOGITS: usize = 0;

/// Word-embedding rows of the decoder, indexed by token id.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    data: Vec<f32>,
    hidden_size: usize,
}

impl EmbeddingTable {
    /// Reads a flat little-endian `f32` table of `rows × hidden_size` values.
    pub fn from_bytes(bytes: &[u8], hidden_size: usize) -> Result<Self> {
        ensure!(hidden_size > 0, "hidden size must be positive");
        ensure!(
            bytes.len() % std::mem::size_of::<f32>() == 0,
            "embedding table is {} bytes, not a whole number of f32 values",
            bytes.len()
        );
        let data = bytes
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect::<Vec<_>>();
        Self::from_vec(data, hidden_size)
    }

    pub fn from_vec(data: Vec<f32>, hidden_size: usize) -> Result<Self> {
        ensure!(hidden_size > 0, "hidden size must be positive");
        ensure!(
            data.len() >= hidden_size,
            "embedding table holds {} values, less than one row of {hidden_size}",
            data.len()
        );
        Ok(Self { data, hidden_size })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Number of complete rows; a trailing partial row is ignored.
    pub fn rows(&self) -> usize {
        self.data.len() / self.hidden_size
    }

    pub fn row(&self, token: u32) -> Option<&[f32]> {
        let start = (token as usize).checked_mul(self.hidden_size)?;
        self.data.get(start..start.checked_add(self.hidden_size)?)
    }
}

/// Why the decode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndToken,
    MaxLength,
    /// The model picked an id outside the vocabulary or the embedding table; output is
    /// truncated before it.
    InvalidToken(u32),
    /// A buffer transfer or decoder run failed; output is truncated at the last good step.
    StepFailed,
}

/// Generated token ids. Index 0 is always the start token and the length never exceeds
/// the capacity fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<u32>,
    capacity: usize,
}

impl TokenSequence {
    pub fn new(capacity: usize, start_token: u32) -> Self {
        let mut ids = Vec::with_capacity(capacity);
        ids.push(start_token);
        Self { ids, capacity }
    }

    fn reset(&mut self, start_token: u32) {
        self.ids.clear();
        self.ids.push(start_token);
    }

    fn push(&mut self, id: u32) -> bool {
        if self.ids.len() >= self.capacity {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }
}

/// Scratch memory shared by every recognition call. It is reset, never reallocated.
#[derive(Debug)]
pub struct DecodeArena {
    tokens: TokenSequence,
    attention_mask: Vec<f32>,
    embeddings_input: Vec<f32>,
    hidden_state: Vec<f32>,
    logits: Vec<f32>,
    hidden_size: usize,
}

impl DecodeArena {
    /// `hidden_state_len` and `logits_len` come from the compiled models' buffers.
    pub fn new(config: &EngineConfig, hidden_state_len: usize, logits_len: usize) -> Self {
        let max_len = config.max_sequence_length;
        Self {
            tokens: TokenSequence::new(max_len, config.start_token_id),
            attention_mask: vec![0.0; max_len],
            embeddings_input: vec![0.0; max_len * config.hidden_size],
            hidden_state: vec![0.0; hidden_state_len],
            logits: vec![0.0; logits_len],
            hidden_size: config.hidden_size,
        }
    }

    pub fn tokens(&self) -> &TokenSequence {
        &self.tokens
    }

    pub fn attention_mask(&self) -> &[f32] {
        &self.attention_mask
    }

    pub fn embeddings_input(&self) -> &[f32] {
        &self.embeddings_input
    }

    pub fn hidden_state(&self) -> &[f32] {
        &self.hidden_state
    }

    pub fn hidden_state_mut(&mut self) -> &mut [f32] {
        &mut self.hidden_state
    }

    fn reset(&mut self, start_token: u32, embeddings: &EmbeddingTable) -> Result<()> {
        self.tokens.reset(start_token);
        self.attention_mask.fill(0.0);
        self.embeddings_input.fill(0.0);
        self.logits.fill(0.0);

        let row = embeddings
            .row(start_token)
            .with_context(|| format!("embedding table has no row for start token {start_token}"))?;
        self.set_position(0, row);
        Ok(())
    }

    fn set_position(&mut self, index: usize, row: &[f32]) {
        let offset = index * self.hidden_size;
        self.embeddings_input[offset..offset + self.hidden_size].copy_from_slice(row);
        self.attention_mask[index] = 1.0;
    }

    fn append(&mut self, token: u32, row: &[f32]) -> bool {
        let index = self.tokens.len();
        if !self.tokens.push(token) {
            return false;
        }
        self.set_position(index, row);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub stop: StopReason,
    /// Number of decoder invocations.
    pub steps: usize,
    pub decoder_time: Duration,
}

/// Greedy token generation over a compiled decoder.
#[derive(Debug, Clone, Copy)]
pub struct AutoregressiveDecoder {
    start_token: u32,
    end_token: u32,
    vocab_size: usize,
    max_len: usize,
}

impl AutoregressiveDecoder {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            start_token: config.start_token_id,
            end_token: config.end_token_id,
            vocab_size: config.vocab_size,
            max_len: config.max_sequence_length,
        }
    }

    /// Runs the decode loop for the hidden state currently held by `arena`. The generated
    /// ids, without the end token, are left in [`DecodeArena::tokens`].
    #[instrument(level = "info", skip_all)]
    pub fn decode(
        &self,
        model: &dyn CompiledModel,
        buffers: &mut ModelBuffers,
        embeddings: &EmbeddingTable,
        arena: &mut DecodeArena,
    ) -> DecodeOutcome {
        let mut outcome = DecodeOutcome {
            stop: StopReason::StepFailed,
            steps: 0,
            decoder_time: Duration::ZERO,
        };

        if let Err(err) = self.begin(buffers, embeddings, arena) {
            warn!("decoder setup failed: {err:#}");
            return outcome;
        }

        outcome.stop = loop {
            if arena.tokens.len() >= self.max_len {
                break StopReason::MaxLength;
            }

            let started = Instant::now();
            let next = self.step(model, buffers, arena);
            outcome.decoder_time += started.elapsed();
            outcome.steps += 1;

            let token = match next {
                Ok(token) => token,
                Err(err) => {
                    warn!("decoder step {} failed: {err:#}", outcome.steps);
                    break StopReason::StepFailed;
                }
            };
            if token == self.end_token {
                break StopReason::EndToken;
            }
            if token as usize >= self.vocab_size {
                break StopReason::InvalidToken(token);
            }
            let Some(row) = embeddings.row(token) else {
                break StopReason::InvalidToken(token);
            };
            if !arena.append(token, row) {
                break StopReason::MaxLength;
            }
        };

        debug!(
            "decoder stopped after {} steps ({:?}) with {} tokens",
            outcome.steps,
            outcome.stop,
            arena.tokens.len()
        );
        outcome
    }

    /// Single decoder step from the start token, with every failure propagated.
    pub fn warmup(
        &self,
        model: &dyn CompiledModel,
        buffers: &mut ModelBuffers,
        embeddings: &EmbeddingTable,
        arena: &mut DecodeArena,
    ) -> Result<u32> {
        self.begin(buffers, embeddings, arena)?;
        self.step(model, buffers, arena)
    }

    fn begin(
        &self,
        buffers: &mut ModelBuffers,
        embeddings: &EmbeddingTable,
        arena: &mut DecodeArena,
    ) -> Result<()> {
        arena.reset(self.start_token, embeddings)?;
        input_mut(buffers, DECODER_HIDDEN_STATES)?
            .write(&arena.hidden_state)
            .context("failed to write decoder hidden states")
    }

    fn step(
        &self,
        model: &dyn CompiledModel,
        buffers: &mut ModelBuffers,
        arena: &mut DecodeArena,
    ) -> Result<u32> {
        input_mut(buffers, DECODER_ATTENTION_MASK)?
            .write(&arena.attention_mask)
            .context("failed to write decoder attention mask")?;
        input_mut(buffers, DECODER_INPUT_EMBEDDINGS)?
            .write(&arena.embeddings_input)
            .context("failed to write decoder input embeddings")?;

        model
            .run(&buffers.inputs, &mut buffers.outputs)
            .context("failed to run decoder")?;

        let logits = buffers
            .outputs
            .get(DECODER_LOGITS)
            .context("decoder has no logits output")?;
        let read_len = arena.logits.len().min(logits.len());
        logits
            .read(&mut arena.logits[..read_len])
            .context("failed to read decoder logits")?;

        let offset = (arena.tokens.len() - 1) * self.vocab_size;
        let Some(row) = arena.logits[..read_len].get(offset..offset + self.vocab_size) else {
            bail!(
                "logits hold {read_len} values, position {} needs {}",
                arena.tokens.len() - 1,
                offset + self.vocab_size
            );
        };
        let token = argmax(row).context("logits contain no comparable values")?;
        Ok(token as u32)
    }
}

fn input_mut(buffers: &mut ModelBuffers, index: usize) -> Result<&mut crate::runtime::TensorBuffer> {
    let count = buffers.inputs.len();
    buffers
        .inputs
        .get_mut(index)
        .with_context(|| format!("decoder input {index} missing ({count} inputs)"))
}

/// Index of the first maximum, ignoring NaN.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, max)) if value <= max => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: usize, hidden: usize) -> EmbeddingTable {
        let data = (0..rows * hidden).map(|v| v as f32).collect();
        EmbeddingTable::from_vec(data, hidden).expect("table")
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.9, 0.9, -1.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, -5.0, f32::NAN]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), Some(0));
        assert_eq!(argmax(&[f32::NAN]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn embedding_table_reads_little_endian_rows() -> Result<()> {
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let table = EmbeddingTable::from_bytes(&bytes, 3)?;
        assert_eq!(table.rows(), 2);
        assert_eq!(table.row(0), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(table.row(1), Some(&[4.0, 5.0, 6.0][..]));
        assert_eq!(table.row(2), None);
        assert_eq!(table.row(u32::MAX), None);
        Ok(())
    }

    #[test]
    fn embedding_table_rejects_ragged_bytes() {
        assert!(EmbeddingTable::from_bytes(&[0u8; 7], 1).is_err());
        assert!(EmbeddingTable::from_bytes(&[0u8; 8], 3).is_err());
        assert!(EmbeddingTable::from_bytes(&[0u8; 8], 0).is_err());
    }

    #[test]
    fn token_sequence_is_bounded() {
        let mut tokens = TokenSequence::new(3, 2);
        assert_eq!(tokens.as_slice(), &[2]);
        assert!(tokens.push(10));
        assert!(tokens.push(11));
        assert!(tokens.is_full());
        assert!(!tokens.push(12));
        assert_eq!(tokens.as_slice(), &[2, 10, 11]);
        tokens.reset(2);
        assert_eq!(tokens.as_slice(), &[2]);
    }

    #[test]
    fn arena_reset_clears_previous_call() -> Result<()> {
        let config = EngineConfig {
            max_sequence_length: 4,
            hidden_size: 2,
            vocab_size: 8,
            ..EngineConfig::default()
        };
        let embeddings = table(8, 2);
        let mut arena = DecodeArena::new(&config, 6, 32);

        arena.reset(config.start_token_id, &embeddings)?;
        assert!(arena.append(5, embeddings.row(5).expect("row")));
        assert_eq!(arena.attention_mask(), &[1.0, 1.0, 0.0, 0.0]);
        assert_eq!(arena.embeddings_input(), &[4.0, 5.0, 10.0, 11.0, 0.0, 0.0, 0.0, 0.0]);

        arena.reset(config.start_token_id, &embeddings)?;
        assert_eq!(arena.tokens().as_slice(), &[2]);
        assert_eq!(arena.attention_mask(), &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(arena.embeddings_input(), &[4.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(arena.hidden_state().len(), 6);
        Ok(())
    }

    struct IdleModel;

    impl CompiledModel for IdleModel {
        fn role(&self) -> crate::runtime::ModelRole {
            crate::runtime::ModelRole::Decoder
        }

        fn accelerator(&self) -> crate::runtime::Accelerator {
            crate::runtime::Accelerator::Cpu
        }

        fn input_specs(&self) -> Vec<crate::runtime::TensorSpec> {
            Vec::new()
        }

        fn output_specs(&self) -> Vec<crate::runtime::TensorSpec> {
            Vec::new()
        }

        fn is_fully_accelerated(&self) -> Result<bool> {
            Ok(true)
        }

        fn run(
            &self,
            _inputs: &[crate::runtime::TensorBuffer],
            _outputs: &mut [crate::runtime::TensorBuffer],
        ) -> Result<()> {
            bail!("decoder must not run when setup fails")
        }
    }

    #[test]
    fn failed_setup_stops_before_any_step() {
        let config = EngineConfig {
            hidden_size: 2,
            max_sequence_length: 4,
            ..EngineConfig::default()
        };
        let decoder = AutoregressiveDecoder::from_config(&config);
        let mut buffers = ModelBuffers {
            inputs: Vec::new(),
            outputs: Vec::new(),
        };

        for embeddings in [table(2, 2), table(8, 2)] {
            let mut arena = DecodeArena::new(&config, 2, 8);
            let outcome = decoder.decode(&IdleModel, &mut buffers, &embeddings, &mut arena);
            assert_eq!(outcome.stop, StopReason::StepFailed);
            assert_eq!(outcome.steps, 0);
            assert_eq!(arena.tokens().as_slice(), &[config.start_token_id]);
        }
    }

    #[test]
    fn arena_reset_needs_start_row() {
        let config = EngineConfig {
            hidden_size: 2,
            ..EngineConfig::default()
        };
        let embeddings = table(2, 2);
        let mut arena = DecodeArena::new(&config, 2, 2);
        assert!(arena.reset(config.start_token_id, &embeddings).is_err());
    }
}
