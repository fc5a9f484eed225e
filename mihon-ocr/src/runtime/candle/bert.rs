use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, embedding, layer_norm, linear, linear_no_bias};
use serde::Deserialize;

/// Additive mask value for positions a query must not attend to.
const MASKED: f32 = -10000.0;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    #[serde(other)]
    GeluApproximate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
}

/// BERT language-model decoder with cross-attention, driven by precomputed word embeddings
/// instead of token ids. Word-embedding lookup happens on the host from the separately
/// shipped table, so only position and token-type embeddings are loaded here.
pub struct BertDecoder {
    embeddings: BertEmbeddings,
    encoder: BertEncoder,
    cls: BertLMPredictionHead,
}

impl BertDecoder {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let bert = vb.pp("bert");
        Ok(Self {
            embeddings: BertEmbeddings::new(cfg, bert.pp("embeddings"))?,
            encoder: BertEncoder::new(cfg, bert.pp("encoder"))?,
            cls: BertLMPredictionHead::new(cfg, vb.pp("cls").pp("predictions"))?,
        })
    }

    /// `inputs_embeds`: `(batch, seq, hidden)`; `attention_mask`: additive
    /// `(batch, 1, seq, seq)` from [`causal_attention_mask`]; returns `(batch, seq, vocab)`.
    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let hidden_states = self.embeddings.forward(inputs_embeds)?;
        let sequence_output =
            self.encoder
                .forward(&hidden_states, attention_mask, encoder_hidden_states)?;
        self.cls.forward(&sequence_output)
    }
}

/// Combines the padding mask with causal ordering: query `i` sees key `j` iff `j <= i` and
/// position `j` holds a token.
pub fn causal_attention_mask(
    padding: &[f32],
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let seq_len = padding.len();
    let mut mask = vec![MASKED; seq_len * seq_len];
    for query in 0..seq_len {
        for key in 0..=query {
            if padding[key] > 0.5 {
                mask[query * seq_len + key] = 0.0;
            }
        }
    }
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)
}

struct BertEmbeddings {
    position_embeddings: candle_nn::Embedding,
    token_type_embeddings: candle_nn::Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let position_embeddings = embedding(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = embedding(
            cfg.type_vocab_size,
            cfg.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let layer_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self {
            position_embeddings,
            token_type_embeddings,
            layer_norm,
        })
    }

    fn forward(&self, inputs_embeds: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, hidden_size) = inputs_embeds.dims3()?;
        let device = inputs_embeds.device();
        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?.reshape((1, seq_len))?;
        let position_embeds = self.position_embeddings.forward(&position_ids)?;
        let token_type_ids = Tensor::zeros((batch_size, seq_len), DType::U32, device)?;
        let token_type_embeds = self.token_type_embeddings.forward(&token_type_ids)?;

        let embeddings = (inputs_embeds + token_type_embeds)?
            .broadcast_add(&position_embeds.broadcast_as((batch_size, seq_len, hidden_size))?)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_attention_heads: usize,
    attention_head_size: usize,
}

impl BertSelfAttention {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let attention_head_size = cfg.hidden_size / cfg.num_attention_heads;
        let all_head_size = attention_head_size * cfg.num_attention_heads;
        Ok(Self {
            query: linear(cfg.hidden_size, all_head_size, vb.pp("query"))?,
            key: linear(cfg.hidden_size, all_head_size, vb.pp("key"))?,
            value: linear(cfg.hidden_size, all_head_size, vb.pp("value"))?,
            num_attention_heads: cfg.num_attention_heads,
            attention_head_size,
        })
    }

    fn transpose_for_scores(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((
            batch_size,
            seq_len,
            self.num_attention_heads,
            self.attention_head_size,
        ))?
        .transpose(1, 2)
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        key_value_states: Option<&Tensor>,
    ) -> Result<Tensor> {
        let kv_states = key_value_states.unwrap_or(hidden_states);
        let (batch_size, tgt_seq_len, _) = hidden_states.dims3()?;
        let query = self.query.forward(hidden_states)?;
        let key = self.key.forward(kv_states)?;
        let value = self.value.forward(kv_states)?;

        let query = self.transpose_for_scores(&query)?.contiguous()?;
        let key = self.transpose_for_scores(&key)?.contiguous()?;
        let value = self.transpose_for_scores(&value)?.contiguous()?;

        let mut attention_scores =
            (query.matmul(&key.transpose(2, 3)?)? / (self.attention_head_size as f64).sqrt())?;
        if let Some(mask) = attention_mask {
            attention_scores = attention_scores.broadcast_add(mask)?;
        }
        let attention_probs = candle_nn::ops::softmax(&attention_scores, D::Minus1)?;
        let context_layer = attention_probs.matmul(&value)?;
        context_layer.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            tgt_seq_len,
            self.num_attention_heads * self.attention_head_size,
        ))
    }
}

/// Dense projection, residual add and LayerNorm shared by the attention and feed-forward
/// outputs.
struct BertResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertResidualOutput {
    fn new(cfg: &BertConfig, in_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, cfg.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, input_tensor: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

struct BertAttention {
    self_attention: BertSelfAttention,
    output: BertResidualOutput,
}

impl BertAttention {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attention: BertSelfAttention::new(cfg, vb.pp("self"))?,
            output: BertResidualOutput::new(cfg, cfg.hidden_size, vb.pp("output"))?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
    ) -> Result<Tensor> {
        let self_outputs =
            self.self_attention
                .forward(hidden_states, attention_mask, encoder_hidden_states)?;
        self.output.forward(&self_outputs, hidden_states)
    }
}

fn activate(hidden_states: &Tensor, activation: HiddenAct) -> Result<Tensor> {
    match activation {
        HiddenAct::Gelu => hidden_states.gelu_erf(),
        HiddenAct::GeluApproximate => hidden_states.gelu(),
    }
}

struct BertLayer {
    attention: BertAttention,
    cross_attention: BertAttention,
    intermediate: Linear,
    activation: HiddenAct,
    output: BertResidualOutput,
}

impl BertLayer {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: BertAttention::new(cfg, vb.pp("attention"))?,
            cross_attention: BertAttention::new(cfg, vb.pp("crossattention"))?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: cfg.hidden_act,
            output: BertResidualOutput::new(cfg, cfg.intermediate_size, vb.pp("output"))?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let attention_output = self
            .attention
            .forward(hidden_states, Some(attention_mask), None)?;
        // every encoder position is valid, so cross-attention runs unmasked
        let attention_output =
            self.cross_attention
                .forward(&attention_output, None, Some(encoder_hidden_states))?;
        let intermediate_output =
            activate(&self.intermediate.forward(&attention_output)?, self.activation)?;
        self.output.forward(&intermediate_output, &attention_output)
    }
}

struct BertEncoder {
    layers: Vec<BertLayer>,
}

impl BertEncoder {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| BertLayer::new(cfg, vb.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let mut hidden_states = hidden_states.clone();
        for layer in self.layers.iter() {
            hidden_states = layer.forward(&hidden_states, attention_mask, encoder_hidden_states)?;
        }
        Ok(hidden_states)
    }
}

struct BertLMPredictionHead {
    dense: Linear,
    activation: HiddenAct,
    layer_norm: LayerNorm,
    decoder: Linear,
    bias: Tensor,
}

impl BertLMPredictionHead {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let transform = vb.pp("transform");
        Ok(Self {
            dense: linear(cfg.hidden_size, cfg.hidden_size, transform.pp("dense"))?,
            activation: cfg.hidden_act,
            layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                transform.pp("LayerNorm"),
            )?,
            // `decoder.bias` is tied to `bias`, apply it once
            decoder: linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("decoder"))?,
            bias: vb.get(cfg.vocab_size, "bias")?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden_states = activate(&self.dense.forward(hidden_states)?, self.activation)?;
        let hidden_states = self.layer_norm.forward(&hidden_states)?;
        self.decoder.forward(&hidden_states)?.broadcast_add(&self.bias)
    }
}
