//! candle backend: ViT encoder and BERT decoder loaded from safetensors.

pub mod bert;
mod device;
pub mod vit;

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::{info, instrument};

pub use bert::{BertConfig, HiddenAct};
pub use candle_transformers::models::vit::Config as VitConfig;
pub use device::{DeviceName, cuda_is_available, gpu_device};

use super::{
    Accelerator, CompileTarget, CompiledModel, ModelCompiler, ModelRole, Precision,
    TensorBuffer, TensorSpec,
};
use crate::config::{EngineConfig, read_json};
use bert::{BertDecoder, causal_attention_mask};
use vit::VisionEncoder;

const DEFAULT_SEQUENCE_LENGTH: usize = 300;

/// Hugging Face `VisionEncoderDecoder` config (`config.json`) describing both networks.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelArchitecture {
    pub decoder_start_token_id: u32,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    #[serde(default)]
    pub max_length: Option<usize>,
    pub encoder: VitConfig,
    pub decoder: BertConfig,
    /// Tensor-name prefix of the encoder weights; empty when the file holds only the encoder.
    #[serde(default = "default_encoder_prefix")]
    pub encoder_prefix: String,
    #[serde(default = "default_decoder_prefix")]
    pub decoder_prefix: String,
}

fn default_encoder_prefix() -> String {
    "encoder".to_string()
}

fn default_decoder_prefix() -> String {
    "decoder".to_string()
}

impl ModelArchitecture {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Fixed decoder sequence length, capped by the position-embedding table.
    pub fn sequence_length(&self) -> usize {
        self.max_length
            .unwrap_or(DEFAULT_SEQUENCE_LENGTH)
            .min(self.decoder.max_position_embeddings)
    }

    pub fn encoder_sequence_length(&self) -> usize {
        vit::sequence_length(&self.encoder)
    }

    /// Engine settings matching these networks; everything else keeps its default.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            image_size: self.encoder.image_size as u32,
            max_sequence_length: self.sequence_length(),
            vocab_size: self.decoder.vocab_size,
            hidden_size: self.decoder.hidden_size,
            start_token_id: self.decoder_start_token_id,
            end_token_id: self.eos_token_id,
            pad_token_id: self.pad_token_id,
            ..EngineConfig::default()
        }
    }

    fn check(&self) -> Result<()> {
        ensure!(
            self.encoder.hidden_size == self.decoder.hidden_size,
            "encoder hidden size {} does not match decoder hidden size {}",
            self.encoder.hidden_size,
            self.decoder.hidden_size
        );
        ensure!(
            self.encoder.num_channels == 3,
            "encoder expects {} channels, images are RGB",
            self.encoder.num_channels
        );
        ensure!(
            self.encoder.patch_size > 0 && self.encoder.image_size % self.encoder.patch_size == 0,
            "image size {} is not a multiple of patch size {}",
            self.encoder.image_size,
            self.encoder.patch_size
        );
        ensure!(self.sequence_length() > 0, "decoder sequence length is zero");
        Ok(())
    }
}

impl EngineConfig {
    pub fn from_architecture(architecture: &ModelArchitecture) -> Self {
        architecture.engine_config()
    }
}

/// Compiles safetensors weights into candle models. GPU targets use CUDA or Metal, CPU
/// targets always run in F32.
#[derive(Debug, Clone)]
pub struct CandleCompiler {
    architecture: ModelArchitecture,
}

impl CandleCompiler {
    pub fn new(architecture: ModelArchitecture) -> Self {
        Self { architecture }
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    fn device(target: CompileTarget) -> Result<Device> {
        match target.accelerator {
            Accelerator::Gpu => gpu_device(),
            Accelerator::Cpu => Ok(Device::Cpu),
        }
    }

    fn encoder_specs(&self) -> (Vec<TensorSpec>, Vec<TensorSpec>) {
        let cfg = &self.architecture.encoder;
        let inputs = vec![TensorSpec::new(
            "pixel_values",
            [1, cfg.image_size, cfg.image_size, cfg.num_channels],
        )];
        let outputs = vec![TensorSpec::new(
            "last_hidden_state",
            [1, self.architecture.encoder_sequence_length(), cfg.hidden_size],
        )];
        (inputs, outputs)
    }

    fn decoder_specs(&self) -> (Vec<TensorSpec>, Vec<TensorSpec>) {
        let cfg = &self.architecture.decoder;
        let seq_len = self.architecture.sequence_length();
        let inputs = vec![
            TensorSpec::new(
                "encoder_hidden_states",
                [1, self.architecture.encoder_sequence_length(), cfg.hidden_size],
            ),
            TensorSpec::new("attention_mask", [1, seq_len]),
            TensorSpec::new("inputs_embeds", [1, seq_len, cfg.hidden_size]),
        ];
        let outputs = vec![TensorSpec::new("logits", [1, seq_len, cfg.vocab_size])];
        (inputs, outputs)
    }
}

fn scoped<'a>(vb: VarBuilder<'a>, prefix: &str) -> VarBuilder<'a> {
    if prefix.is_empty() { vb } else { vb.pp(prefix) }
}

impl ModelCompiler for CandleCompiler {
    #[instrument(level = "info", skip_all, fields(role = %role, accelerator = %target.accelerator))]
    fn compile(
        &self,
        role: ModelRole,
        bytes: &[u8],
        target: CompileTarget,
    ) -> Result<Box<dyn CompiledModel>> {
        self.architecture.check()?;
        let device = Self::device(target)?;
        let dtype = match target.precision {
            Precision::Half => DType::F16,
            Precision::Full => DType::F32,
        };
        let vb = VarBuilder::from_buffered_safetensors(bytes.to_vec(), dtype, &device)
            .with_context(|| format!("failed to read {role} safetensors"))?;

        let (network, (inputs, outputs)) = match role {
            ModelRole::Encoder => {
                let vb = scoped(vb, &self.architecture.encoder_prefix);
                let encoder = VisionEncoder::new(&self.architecture.encoder, vb)
                    .context("failed to load ViT encoder weights")?;
                (Network::Encoder(encoder), self.encoder_specs())
            }
            ModelRole::Decoder => {
                let vb = scoped(vb, &self.architecture.decoder_prefix);
                let decoder = BertDecoder::new(&self.architecture.decoder, vb)
                    .context("failed to load BERT decoder weights")?;
                (Network::Decoder(decoder), self.decoder_specs())
            }
        };

        info!("{role} loaded on {} ({dtype:?})", DeviceName::of(&device));
        Ok(Box::new(CandleModel {
            role,
            accelerator: target.accelerator,
            device,
            dtype,
            network,
            inputs,
            outputs,
        }))
    }
}

enum Network {
    Encoder(VisionEncoder),
    Decoder(BertDecoder),
}

pub struct CandleModel {
    role: ModelRole,
    accelerator: Accelerator,
    device: Device,
    dtype: DType,
    network: Network,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl CandleModel {
    fn tensor(&self, buffer: &TensorBuffer) -> candle_core::Result<Tensor> {
        Tensor::from_slice(buffer.as_slice(), buffer.shape(), &self.device)?.to_dtype(self.dtype)
    }

    fn forward(&self, inputs: &[TensorBuffer]) -> candle_core::Result<Tensor> {
        match &self.network {
            Network::Encoder(encoder) => {
                // buffers are NHWC, the patch convolution wants NCHW
                let pixel_values = self.tensor(&inputs[0])?.permute((0, 3, 1, 2))?.contiguous()?;
                encoder.forward(&pixel_values)
            }
            Network::Decoder(decoder) => {
                let encoder_hidden_states = self.tensor(&inputs[0])?;
                let attention_mask =
                    causal_attention_mask(inputs[1].as_slice(), &self.device, self.dtype)?;
                let inputs_embeds = self.tensor(&inputs[2])?;
                decoder.forward(&inputs_embeds, &attention_mask, &encoder_hidden_states)
            }
        }
    }
}

impl CompiledModel for CandleModel {
    fn role(&self) -> ModelRole {
        self.role
    }

    fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    fn input_specs(&self) -> Vec<TensorSpec> {
        self.inputs.clone()
    }

    fn output_specs(&self) -> Vec<TensorSpec> {
        self.outputs.clone()
    }

    fn is_fully_accelerated(&self) -> Result<bool> {
        Ok(match self.accelerator {
            Accelerator::Gpu => !self.device.is_cpu(),
            Accelerator::Cpu => true,
        })
    }

    fn run(&self, inputs: &[TensorBuffer], outputs: &mut [TensorBuffer]) -> Result<()> {
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            bail!(
                "{} expects {} inputs and {} outputs, got {} and {}",
                self.role,
                self.inputs.len(),
                self.outputs.len(),
                inputs.len(),
                outputs.len()
            );
        }
        for (buffer, spec) in inputs.iter().zip(&self.inputs) {
            ensure!(
                buffer.shape() == spec.shape.as_slice(),
                "{} input {} has shape {:?}, expected {:?}",
                self.role,
                spec.name,
                buffer.shape(),
                spec.shape
            );
        }

        let output = self
            .forward(inputs)
            .with_context(|| format!("{} forward pass failed", self.role))?;
        let values = output.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        ensure!(
            values.len() == outputs[0].len(),
            "{} produced {} values for a {} float output",
            self.role,
            values.len(),
            outputs[0].len()
        );
        outputs[0].write(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCHITECTURE: &str = r#"{
        "decoder_start_token_id": 2,
        "eos_token_id": 3,
        "pad_token_id": 0,
        "max_length": 300,
        "encoder": {
            "hidden_size": 768, "num_hidden_layers": 12, "num_attention_heads": 12,
            "intermediate_size": 3072, "hidden_act": "gelu", "layer_norm_eps": 1e-12,
            "image_size": 224, "patch_size": 16, "num_channels": 3, "qkv_bias": true
        },
        "decoder": {
            "vocab_size": 6144, "hidden_size": 768, "num_hidden_layers": 2,
            "num_attention_heads": 12, "intermediate_size": 3072, "hidden_act": "gelu",
            "max_position_embeddings": 512, "type_vocab_size": 2, "layer_norm_eps": 1e-12
        }
    }"#;

    fn architecture() -> ModelArchitecture {
        serde_json::from_str(ARCHITECTURE).expect("architecture should parse")
    }

    #[test]
    fn architecture_maps_to_engine_config() {
        let arch = architecture();
        assert_eq!(arch.encoder_prefix, "encoder");
        assert_eq!(arch.decoder_prefix, "decoder");
        assert_eq!(arch.encoder_sequence_length(), 197);
        assert!(arch.check().is_ok());

        assert_eq!(arch.engine_config(), EngineConfig::default());
    }

    #[test]
    fn sequence_length_is_capped_by_positions() {
        let mut arch = architecture();
        arch.max_length = Some(1024);
        assert_eq!(arch.sequence_length(), 512);
        arch.max_length = None;
        assert_eq!(arch.sequence_length(), DEFAULT_SEQUENCE_LENGTH);
    }

    #[test]
    fn mismatched_hidden_sizes_are_rejected() {
        let mut arch = architecture();
        arch.decoder.hidden_size = 512;
        assert!(arch.check().is_err());
    }

    #[test]
    fn decoder_specs_follow_input_order() {
        let compiler = CandleCompiler::new(architecture());
        let (inputs, outputs) = compiler.decoder_specs();
        let names: Vec<_> = inputs.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, ["encoder_hidden_states", "attention_mask", "inputs_embeds"]);
        assert_eq!(inputs[0].shape, vec![1, 197, 768]);
        assert_eq!(outputs[0].shape, vec![1, 300, 6144]);
    }

    #[test]
    fn garbage_weights_fail_to_compile() {
        let compiler = CandleCompiler::new(architecture());
        let result = compiler.compile(ModelRole::Encoder, b"not safetensors", CompileTarget::cpu());
        assert!(result.is_err());
    }
}
