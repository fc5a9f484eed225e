use std::fmt;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use super::{Accelerator, CompileTarget, CompiledModel, ModelCompiler, ModelRole};
use crate::config::AcceleratorPolicy;
use crate::error::OcrError;

/// Accelerator each model ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Accelerators {
    pub encoder: Accelerator,
    pub decoder: Accelerator,
}

impl Accelerators {
    pub fn uniform(accelerator: Accelerator) -> Self {
        Self {
            encoder: accelerator,
            decoder: accelerator,
        }
    }

    pub fn is_using_gpu(&self) -> bool {
        self.encoder == Accelerator::Gpu && self.decoder == Accelerator::Gpu
    }
}

impl fmt::Display for Accelerators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.encoder, self.decoder)
    }
}

pub struct NegotiatedModels {
    pub encoder: Box<dyn CompiledModel>,
    pub decoder: Box<dyn CompiledModel>,
    pub accelerators: Accelerators,
}

impl fmt::Debug for NegotiatedModels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedModels")
            .field("accelerators", &self.accelerators)
            .finish_non_exhaustive()
    }
}

/// Compiles the encoder/decoder pair, GPU first, and applies the [`AcceleratorPolicy`]
/// when the GPU attempt is rejected.
pub struct AcceleratorNegotiator<'a> {
    compiler: &'a dyn ModelCompiler,
    policy: AcceleratorPolicy,
    half_precision: bool,
}

impl<'a> AcceleratorNegotiator<'a> {
    pub fn new(compiler: &'a dyn ModelCompiler, policy: AcceleratorPolicy, half_precision: bool) -> Self {
        Self {
            compiler,
            policy,
            half_precision,
        }
    }

    #[instrument(level = "info", skip_all, fields(policy = %self.policy))]
    pub fn compile(
        &self,
        encoder_bytes: &[u8],
        decoder_bytes: &[u8],
    ) -> crate::error::Result<NegotiatedModels> {
        let gpu_err = match self.compile_gpu(encoder_bytes, decoder_bytes) {
            Ok(models) => return Ok(models),
            Err(err) => err,
        };

        match self.policy {
            AcceleratorPolicy::GpuMandatory => Err(OcrError::Init(format!(
                "GPU acceleration is required: {gpu_err:#}"
            ))),
            AcceleratorPolicy::PreferGpuFallbackCpu => {
                warn!("GPU compilation rejected, falling back to CPU: {gpu_err:#}");
                self.compile_cpu(encoder_bytes, decoder_bytes)
                    .map_err(|err| OcrError::Init(format!("CPU compilation failed: {err:#}")))
            }
        }
    }

    fn compile_gpu(&self, encoder_bytes: &[u8], decoder_bytes: &[u8]) -> Result<NegotiatedModels> {
        let target = CompileTarget::gpu(self.half_precision);
        let encoder = self.compile_fully_accelerated(ModelRole::Encoder, encoder_bytes, target)?;
        let decoder = self.compile_fully_accelerated(ModelRole::Decoder, decoder_bytes, target)?;

        info!("encoder and decoder are fully GPU-accelerated ({})", target.precision);
        Ok(NegotiatedModels {
            encoder,
            decoder,
            accelerators: Accelerators::uniform(Accelerator::Gpu),
        })
    }

    fn compile_cpu(&self, encoder_bytes: &[u8], decoder_bytes: &[u8]) -> Result<NegotiatedModels> {
        let target = CompileTarget::cpu();
        let encoder = self.compile_role(ModelRole::Encoder, encoder_bytes, target)?;
        let decoder = self.compile_role(ModelRole::Decoder, decoder_bytes, target)?;

        info!("encoder and decoder compiled for CPU");
        Ok(NegotiatedModels {
            encoder,
            decoder,
            accelerators: Accelerators::uniform(Accelerator::Cpu),
        })
    }

    fn compile_fully_accelerated(
        &self,
        role: ModelRole,
        bytes: &[u8],
        target: CompileTarget,
    ) -> Result<Box<dyn CompiledModel>> {
        let model = self.compile_role(role, bytes, target)?;
        let fully = model
            .is_fully_accelerated()
            .with_context(|| format!("failed to query {role} acceleration status"))?;
        if !fully {
            bail!("{role} is only partially accelerated on {}", target.accelerator);
        }
        Ok(model)
    }

    fn compile_role(
        &self,
        role: ModelRole,
        bytes: &[u8],
        target: CompileTarget,
    ) -> Result<Box<dyn CompiledModel>> {
        let model = self
            .compiler
            .compile(role, bytes, target)
            .with_context(|| format!("failed to compile {role} for {}", target.accelerator))?;
        if model.role() != role {
            bail!("compiler returned a {} model for the {role}", model.role());
        }
        if model.accelerator() != target.accelerator {
            bail!(
                "{role} was compiled for {} instead of {}",
                model.accelerator(),
                target.accelerator
            );
        }
        Ok(model)
    }
}
