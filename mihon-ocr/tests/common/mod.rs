#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use mihon_ocr::runtime::{
    Accelerator, CompileTarget, CompiledModel, ModelCompiler, ModelRole, TensorBuffer, TensorSpec,
};
use mihon_ocr::{AcceleratorPolicy, EngineConfig, Vocabulary};

pub const IMAGE_SIZE: u32 = 8;
pub const MAX_LEN: usize = 6;
pub const VOCAB: usize = 16;
pub const HIDDEN: usize = 4;
pub const PATCHES: usize = 3;
pub const END: u32 = 3;

pub fn config(policy: AcceleratorPolicy) -> EngineConfig {
    EngineConfig {
        policy,
        image_size: IMAGE_SIZE,
        max_sequence_length: MAX_LEN,
        vocab_size: VOCAB,
        hidden_size: HIDDEN,
        ..EngineConfig::default()
    }
}

/// Ids 5..=9 are あ..お, 10 is `a`, 11 is `.`, 12 is `…`, 13 is a space, 14 and 15 are `x`/`y`.
pub fn vocabulary() -> Vocabulary {
    Vocabulary::from_text(
        "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nあ\nい\nう\nえ\nお\na\n.\n…\n \nx\ny\n",
    )
}

pub fn embeddings(rows: usize) -> Vec<u8> {
    (0..rows * HIDDEN)
        .flat_map(|i| (i as f32 * 0.01).to_le_bytes())
        .collect()
}

pub fn image() -> image::DynamicImage {
    image::DynamicImage::new_rgb8(20, 10)
}

/// How the fake backend behaves. Decoder output at position `p` is `tokens[p]`, or the end
/// token once the script runs out.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub tokens: Vec<u32>,
    pub gpu_fails: bool,
    pub gpu_partial: bool,
    pub cpu_fails: bool,
    /// Decoder input 0 sized for a different encoder.
    pub hidden_mismatch: bool,
    /// Decoder exposes only its hidden-state and mask inputs.
    pub missing_embeddings_input: bool,
    /// Position at which the decoder run errors.
    pub fail_at: Option<usize>,
    pub run_delay: Option<Duration>,
}

impl Script {
    pub fn tokens(tokens: impl Into<Vec<u32>>) -> Self {
        Self {
            tokens: tokens.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub compiled: Mutex<Vec<(ModelRole, CompileTarget)>>,
    pub encoder_runs: AtomicUsize,
    pub decoder_runs: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub encoder_fails: AtomicBool,
}

impl Recorder {
    pub fn targets(&self) -> Vec<(ModelRole, CompileTarget)> {
        self.compiled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct FakeCompiler {
    pub script: Arc<Script>,
    pub recorder: Arc<Recorder>,
}

impl FakeCompiler {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            recorder: Arc::new(Recorder::default()),
        }
    }
}

impl ModelCompiler for FakeCompiler {
    fn compile(
        &self,
        role: ModelRole,
        _bytes: &[u8],
        target: CompileTarget,
    ) -> Result<Box<dyn CompiledModel>> {
        if let Ok(mut compiled) = self.recorder.compiled.lock() {
            compiled.push((role, target));
        }
        let fully_accelerated = match target.accelerator {
            Accelerator::Gpu if self.script.gpu_fails => bail!("no GPU delegate"),
            Accelerator::Cpu if self.script.cpu_fails => bail!("no CPU kernels"),
            Accelerator::Gpu => !self.script.gpu_partial,
            Accelerator::Cpu => true,
        };
        Ok(Box::new(FakeModel {
            role,
            accelerator: target.accelerator,
            fully_accelerated,
            script: self.script.clone(),
            recorder: self.recorder.clone(),
        }))
    }
}

struct FakeModel {
    role: ModelRole,
    accelerator: Accelerator,
    fully_accelerated: bool,
    script: Arc<Script>,
    recorder: Arc<Recorder>,
}

impl FakeModel {
    fn encode(&self, inputs: &[TensorBuffer], outputs: &mut [TensorBuffer]) -> Result<()> {
        self.recorder.encoder_runs.fetch_add(1, Ordering::SeqCst);
        if self.recorder.encoder_fails.load(Ordering::SeqCst) {
            bail!("encoder crashed");
        }
        let mean = inputs[0].as_slice().iter().sum::<f32>() / inputs[0].len() as f32;
        outputs[0].as_mut_slice().fill(mean);
        Ok(())
    }

    fn decode(&self, inputs: &[TensorBuffer], outputs: &mut [TensorBuffer]) -> Result<()> {
        self.recorder.decoder_runs.fetch_add(1, Ordering::SeqCst);
        let len = inputs[1].as_slice().iter().filter(|&&v| v > 0.5).count();
        let position = len.saturating_sub(1);
        if self.script.fail_at == Some(position) {
            bail!("decoder crashed at position {position}");
        }
        let token = self.script.tokens.get(position).copied().unwrap_or(END);
        let logits = outputs[0].as_mut_slice();
        logits.fill(0.0);
        logits[position * VOCAB + token as usize] = 1.0;
        Ok(())
    }
}

impl CompiledModel for FakeModel {
    fn role(&self) -> ModelRole {
        self.role
    }

    fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    fn input_specs(&self) -> Vec<TensorSpec> {
        let side = IMAGE_SIZE as usize;
        match self.role {
            ModelRole::Encoder => vec![TensorSpec::new("pixel_values", [1, side, side, 3])],
            ModelRole::Decoder => {
                let patches = if self.script.hidden_mismatch {
                    PATCHES - 1
                } else {
                    PATCHES
                };
                let mut specs = vec![
                    TensorSpec::new("encoder_hidden_states", [1, patches, HIDDEN]),
                    TensorSpec::new("attention_mask", [1, MAX_LEN]),
                    TensorSpec::new("inputs_embeds", [1, MAX_LEN, HIDDEN]),
                ];
                if self.script.missing_embeddings_input {
                    specs.pop();
                }
                specs
            }
        }
    }

    fn output_specs(&self) -> Vec<TensorSpec> {
        match self.role {
            ModelRole::Encoder => {
                vec![TensorSpec::new("last_hidden_state", [1, PATCHES, HIDDEN])]
            }
            ModelRole::Decoder => vec![TensorSpec::new("logits", [1, MAX_LEN, VOCAB])],
        }
    }

    fn is_fully_accelerated(&self) -> Result<bool> {
        Ok(self.fully_accelerated)
    }

    fn run(&self, inputs: &[TensorBuffer], outputs: &mut [TensorBuffer]) -> Result<()> {
        let active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.script.run_delay {
            std::thread::sleep(delay);
        }
        let result = match self.role {
            ModelRole::Encoder => self.encode(inputs, outputs),
            ModelRole::Decoder => self.decode(inputs, outputs),
        };
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
