use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use mihon_ocr::runtime::candle::bert::BertDecoder;
use mihon_ocr::runtime::candle::vit::VisionEncoder;
use mihon_ocr::runtime::candle::{CandleCompiler, ModelArchitecture};
use mihon_ocr::{Accelerator, AcceleratorPolicy, OcrEngine, OcrError, Vocabulary};

const ARCHITECTURE: &str = r#"{
    "decoder_start_token_id": 2,
    "eos_token_id": 3,
    "pad_token_id": 0,
    "max_length": 8,
    "encoder": {
        "hidden_size": 16, "num_hidden_layers": 1, "num_attention_heads": 2,
        "intermediate_size": 32, "hidden_act": "gelu", "layer_norm_eps": 1e-12,
        "image_size": 32, "patch_size": 16, "num_channels": 3, "qkv_bias": true
    },
    "decoder": {
        "vocab_size": 12, "hidden_size": 16, "num_hidden_layers": 1,
        "num_attention_heads": 2, "intermediate_size": 32, "hidden_act": "gelu",
        "max_position_embeddings": 16, "type_vocab_size": 2, "layer_norm_eps": 1e-12
    }
}"#;

struct TinyModel {
    _dir: tempfile::TempDir,
    architecture: ModelArchitecture,
    weights: Vec<u8>,
    embeddings: Vec<u8>,
}

/// Randomly initialized encoder-decoder saved the way Hugging Face checkpoints are laid out.
fn tiny_model() -> anyhow::Result<TinyModel> {
    let architecture: ModelArchitecture = serde_json::from_str(ARCHITECTURE)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    VisionEncoder::new(&architecture.encoder, vb.pp("encoder"))?;
    BertDecoder::new(&architecture.decoder, vb.pp("decoder"))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");
    varmap.save(&path)?;
    let weights = std::fs::read(&path)?;

    let decoder = &architecture.decoder;
    let embeddings = (0..decoder.vocab_size * decoder.hidden_size)
        .flat_map(|i| ((i % 7) as f32 * 0.1 - 0.3).to_le_bytes())
        .collect();

    Ok(TinyModel {
        _dir: dir,
        architecture,
        weights,
        embeddings,
    })
}

fn vocabulary() -> Vocabulary {
    Vocabulary::from_text("[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nア\nイ\nウ\nエ\nオ\n##カ\n！\n")
}

#[test]
fn tiny_model_runs_end_to_end_on_cpu() -> anyhow::Result<()> {
    let model = tiny_model()?;
    let config = model
        .architecture
        .engine_config()
        .with_policy(AcceleratorPolicy::PreferGpuFallbackCpu);
    assert_eq!(config.max_sequence_length, 8);

    let engine = OcrEngine::new(
        config,
        CandleCompiler::new(model.architecture.clone()),
        vocabulary(),
    );
    engine.initialize(&model.weights, &model.weights, &model.embeddings)?;
    let accelerators = engine.accelerators().expect("engine is initialized");
    if !cfg!(any(feature = "cuda", feature = "metal")) {
        assert_eq!(accelerators.encoder, Accelerator::Cpu);
    }

    let image = image::DynamicImage::new_rgb8(64, 20);
    let first = engine.recognize_detailed(&image)?;
    let second = engine.recognize_detailed(&image)?;

    assert_eq!(first.tokens[0], 2);
    assert!(first.tokens.len() <= 8);
    assert!(first.steps <= 8);
    assert_eq!(first.text, second.text);
    assert_eq!(first.tokens, second.tokens);
    Ok(())
}

#[test]
fn cpu_only_build_rejects_mandatory_gpu() -> anyhow::Result<()> {
    if cfg!(any(feature = "cuda", feature = "metal")) {
        return Ok(());
    }
    let model = tiny_model()?;
    let engine = OcrEngine::new(
        model.architecture.engine_config(),
        CandleCompiler::new(model.architecture.clone()),
        vocabulary(),
    );
    let err = engine
        .initialize(&model.weights, &model.weights, &model.embeddings)
        .unwrap_err();
    assert!(matches!(err, OcrError::Init(_)), "{err}");
    Ok(())
}

#[test]
fn missing_weights_fail_initialize() -> anyhow::Result<()> {
    let model = tiny_model()?;
    let mut architecture = model.architecture.clone();
    architecture.decoder_prefix = "not-there".to_string();
    let engine = OcrEngine::new(
        architecture
            .engine_config()
            .with_policy(AcceleratorPolicy::PreferGpuFallbackCpu),
        CandleCompiler::new(architecture),
        vocabulary(),
    );
    let err = engine
        .initialize(&model.weights, &model.weights, &model.embeddings)
        .unwrap_err();
    assert!(matches!(err, OcrError::Init(_)), "{err}");
    Ok(())
}
