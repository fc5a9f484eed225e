use anyhow::{Result, bail};
use tracing::info;

use super::CompiledModel;
use crate::error::OcrError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Host-side `f32` storage for one model input or output.
///
/// Buffers are created once per compiled model and reused for every call, so they are only
/// ever overwritten, never resized.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    spec: TensorSpec,
    data: Vec<f32>,
}

impl TensorBuffer {
    pub fn allocate(spec: &TensorSpec) -> Result<Self> {
        let len = spec.element_count();
        if len == 0 {
            bail!("tensor {} has no elements (shape {:?})", spec.name, spec.shape);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|err| {
            anyhow::anyhow!("cannot reserve {len} floats for tensor {}: {err}", spec.name)
        })?;
        data.resize(len, 0.0);
        Ok(Self {
            spec: spec.clone(),
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.spec.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Copies `src` into the front of the buffer. Elements past `src.len()` keep their
    /// previous contents.
    pub fn write(&mut self, src: &[f32]) -> Result<()> {
        if src.len() > self.data.len() {
            bail!(
                "write of {} floats overflows tensor {} ({} floats)",
                src.len(),
                self.spec.name,
                self.data.len()
            );
        }
        self.data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Fills `dst` from the front of the buffer.
    pub fn read(&self, dst: &mut [f32]) -> Result<()> {
        if dst.len() > self.data.len() {
            bail!(
                "read of {} floats exceeds tensor {} ({} floats)",
                dst.len(),
                self.spec.name,
                self.data.len()
            );
        }
        dst.copy_from_slice(&self.data[..dst.len()]);
        Ok(())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

pub fn buffer_element_count(buffer: &TensorBuffer) -> usize {
    buffer.size_bytes() / std::mem::size_of::<f32>()
}

#[derive(Debug)]
pub struct ModelBuffers {
    pub inputs: Vec<TensorBuffer>,
    pub outputs: Vec<TensorBuffer>,
}

impl ModelBuffers {
    pub fn input(&self, index: usize) -> Option<&TensorBuffer> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&TensorBuffer> {
        self.outputs.get(index)
    }
}

/// Allocates every input and output buffer `model` reports, sized from its tensor specs.
pub fn create_buffers(model: &dyn CompiledModel) -> crate::error::Result<ModelBuffers> {
    let role = model.role();
    let inputs = model.create_input_buffers().map_err(|err| {
        OcrError::BufferAllocation(format!("{role} input buffers: {err:#}"))
    })?;
    let outputs = model.create_output_buffers().map_err(|err| {
        OcrError::BufferAllocation(format!("{role} output buffers: {err:#}"))
    })?;
    if inputs.is_empty() || outputs.is_empty() {
        return Err(OcrError::BufferAllocation(format!(
            "{role} reports {} inputs and {} outputs",
            inputs.len(),
            outputs.len()
        )));
    }

    info!(
        "{role} buffers: {} inputs {:?}, {} outputs {:?}",
        inputs.len(),
        inputs.iter().map(TensorBuffer::shape).collect::<Vec<_>>(),
        outputs.len(),
        outputs.iter().map(TensorBuffer::shape).collect::<Vec<_>>(),
    );

    Ok(ModelBuffers { inputs, outputs })
}
