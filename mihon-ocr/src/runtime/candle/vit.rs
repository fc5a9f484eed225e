use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder, layer_norm};
use candle_transformers::models::vit::{self, Config as VitConfig};

/// ViT image encoder: patch embeddings with a class token, transformer layers, final LayerNorm.
pub struct VisionEncoder {
    embeddings: vit::Embeddings,
    encoder: vit::Encoder,
    layernorm: LayerNorm,
}

impl VisionEncoder {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = vit::Embeddings::new(cfg, false, vb.pp("embeddings"))?;
        let encoder = vit::Encoder::new(cfg, vb.pp("encoder"))?;
        let layernorm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layernorm"))?;
        Ok(Self {
            embeddings,
            encoder,
            layernorm,
        })
    }

    /// `pixel_values`: `(batch, channels, height, width)`; returns
    /// `(batch, patches + 1, hidden)`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let embeddings = self.embeddings.forward(pixel_values, None, false)?;
        let hidden_states = self.encoder.forward(&embeddings)?;
        self.layernorm.forward(&hidden_states)
    }
}

/// Number of positions the encoder emits for one image: one per patch plus the class token.
pub fn sequence_length(cfg: &VitConfig) -> usize {
    let per_side = cfg.image_size / cfg.patch_size;
    per_side * per_side + 1
}
