use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use mihon_ocr::runtime::candle::{CandleCompiler, ModelArchitecture};
use mihon_ocr::{AcceleratorPolicy, EngineConfig, OcrEngine, Vocabulary};
use tracing_subscriber::fmt::format::FmtSpan;

const WORD_EMBEDDINGS: &str = "decoder.bert.embeddings.word_embeddings.weight";

#[derive(Parser)]
#[command(version, about = "Japanese manga text-line OCR")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize text in one or more cropped text-line images
    Recognize(RecognizeArgs),
    /// Extract the decoder word-embedding table as raw little-endian f32
    ExportEmbeddings {
        #[arg(short, long, value_name = "FILE")]
        model: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long, default_value = WORD_EMBEDDINGS)]
        tensor: String,
    },
}

#[derive(clap::Args)]
struct RecognizeArgs {
    /// Model `config.json`
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    #[arg(long, value_name = "FILE")]
    vocab: PathBuf,

    #[arg(long, value_name = "FILE")]
    encoder: PathBuf,

    /// Defaults to the encoder file, for checkpoints holding both networks
    #[arg(long, value_name = "FILE")]
    decoder: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    embeddings: PathBuf,

    /// Engine settings overriding those derived from `--config`
    #[arg(long, value_name = "FILE")]
    engine_config: Option<PathBuf>,

    #[arg(long)]
    policy: Option<AcceleratorPolicy>,

    /// Print one JSON report per image instead of plain text
    #[arg(long, default_value_t = false)]
    json: bool,

    #[arg(required = true, value_name = "IMAGE")]
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Recognize(args) => recognize(args),
        Command::ExportEmbeddings {
            model,
            output,
            tensor,
        } => export_embeddings(&model, &output, &tensor),
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn recognize(args: RecognizeArgs) -> Result<()> {
    let architecture = ModelArchitecture::load(&args.config)?;
    let mut config = match &args.engine_config {
        Some(path) => EngineConfig::load(path)?,
        None => architecture.engine_config(),
    };
    if let Some(policy) = args.policy {
        config.policy = policy;
    }

    let vocabulary = Vocabulary::load(&args.vocab)?;
    let engine = OcrEngine::new(config, CandleCompiler::new(architecture), vocabulary);

    let encoder = read(&args.encoder)?;
    let decoder = match &args.decoder {
        Some(path) => read(path)?,
        None => encoder.clone(),
    };
    let embeddings = read(&args.embeddings)?;
    engine.initialize(&encoder, &decoder, &embeddings)?;

    for path in &args.images {
        let image =
            image::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        if args.json {
            let report = engine.recognize_detailed(&image)?;
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}", engine.recognize(&image)?);
        }
    }

    engine.close();
    Ok(())
}

fn export_embeddings(model: &Path, output: &Path, tensor: &str) -> Result<()> {
    let bytes = read(model)?;
    let tensors = candle_core::safetensors::load_buffer(&bytes, &Device::Cpu)?;
    let weight = tensors
        .get(tensor)
        .with_context(|| format!("{} has no tensor {tensor}", model.display()))?;
    let (rows, hidden) = weight.dims2()?;
    let values = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(output, raw)
        .with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!("wrote {rows}x{hidden} embedding table to {}", output.display());
    Ok(())
}
