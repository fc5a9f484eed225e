use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// How the engine reacts when the models cannot be fully accelerated on the GPU.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcceleratorPolicy {
    /// GPU compilation must succeed with full acceleration, otherwise `initialize` fails.
    #[default]
    GpuMandatory,
    /// Try the GPU first and recompile both models for the CPU if it is rejected.
    PreferGpuFallbackCpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: AcceleratorPolicy,
    /// Side of the square image fed to the encoder.
    pub image_size: u32,
    pub max_sequence_length: usize,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub start_token_id: u32,
    pub end_token_id: u32,
    pub pad_token_id: u32,
    /// Token ids below this value are control tokens and never reach the output text.
    pub special_token_threshold: u32,
    pub image_mean: f32,
    pub image_std: f32,
    /// Request F16 weights when compiling for the GPU.
    pub half_precision: bool,
    /// GPU runtimes above this budget are reported as warnings.
    pub latency_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: AcceleratorPolicy::default(),
            image_size: 224,
            max_sequence_length: 300,
            vocab_size: 6144,
            hidden_size: 768,
            start_token_id: 2,
            end_token_id: 3,
            pad_token_id: 0,
            special_token_threshold: 5,
            image_mean: 0.5,
            image_std: 0.5,
            half_precision: true,
            latency_budget_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn with_policy(mut self, policy: AcceleratorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Number of floats in one preprocessed image.
    pub fn image_tensor_len(&self) -> usize {
        let side = self.image_size as usize;
        side * side * 3
    }

    pub(crate) fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.image_size > 0, "image_size must be positive");
        anyhow::ensure!(
            self.max_sequence_length >= 1,
            "max_sequence_length must be at least 1"
        );
        anyhow::ensure!(self.vocab_size > 0, "vocab_size must be positive");
        anyhow::ensure!(self.hidden_size > 0, "hidden_size must be positive");
        anyhow::ensure!(
            (self.start_token_id as usize) < self.vocab_size,
            "start_token_id {} is outside of vocab",
            self.start_token_id
        );
        anyhow::ensure!(self.image_std != 0.0, "image_std must not be zero");
        Ok(())
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}
