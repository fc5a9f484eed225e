//! Compiled-model seam between the engine and an inference backend.
//!
//! The engine only talks to [`ModelCompiler`] and [`CompiledModel`]; the bundled candle
//! backend lives in [`candle`], tests plug in scripted implementations.

mod buffers;
pub mod candle;
mod negotiate;

use anyhow::Result;

pub use buffers::{ModelBuffers, TensorBuffer, TensorSpec, buffer_element_count, create_buffers};
pub use negotiate::{AcceleratorNegotiator, Accelerators, NegotiatedModels};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ModelRole {
    #[strum(to_string = "encoder")]
    Encoder,
    #[strum(to_string = "decoder")]
    Decoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Accelerator {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Precision {
    #[strum(to_string = "f16")]
    Half,
    #[strum(to_string = "f32")]
    Full,
}

/// What a model is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileTarget {
    pub accelerator: Accelerator,
    pub precision: Precision,
}

impl CompileTarget {
    pub fn gpu(half_precision: bool) -> Self {
        Self {
            accelerator: Accelerator::Gpu,
            precision: if half_precision {
                Precision::Half
            } else {
                Precision::Full
            },
        }
    }

    pub fn cpu() -> Self {
        Self {
            accelerator: Accelerator::Cpu,
            precision: Precision::Full,
        }
    }
}

/// A model bound to one accelerator, runnable against host-side tensor buffers.
///
/// Inputs and outputs are addressed positionally; the encoder takes the image tensor and
/// produces hidden states, the decoder takes `(hidden states, attention mask, input
/// embeddings)` and produces logits.
pub trait CompiledModel: Send {
    fn role(&self) -> ModelRole;

    fn accelerator(&self) -> Accelerator;

    fn input_specs(&self) -> Vec<TensorSpec>;

    fn output_specs(&self) -> Vec<TensorSpec>;

    /// Whether every operation runs on [`CompiledModel::accelerator`], with nothing
    /// silently falling back to another backend.
    fn is_fully_accelerated(&self) -> Result<bool>;

    fn run(&self, inputs: &[TensorBuffer], outputs: &mut [TensorBuffer]) -> Result<()>;

    fn create_input_buffers(&self) -> Result<Vec<TensorBuffer>> {
        self.input_specs().iter().map(TensorBuffer::allocate).collect()
    }

    fn create_output_buffers(&self) -> Result<Vec<TensorBuffer>> {
        self.output_specs().iter().map(TensorBuffer::allocate).collect()
    }
}

/// Turns model bytes into a [`CompiledModel`] for a given target.
pub trait ModelCompiler: Send + Sync {
    fn compile(
        &self,
        role: ModelRole,
        bytes: &[u8],
        target: CompileTarget,
    ) -> Result<Box<dyn CompiledModel>>;
}
