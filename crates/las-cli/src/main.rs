//!
//! CLI для LAS: жадное распознавание по готовым признакам и осмотр модели.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use asr_core::{collate, Utterance, Vocabulary};
use model_las::{DecodeOptions, LasConfig, LasModel};

#[derive(Parser)]
#[command(name = "rustlas")]
#[command(author, version, about = "RustLAS: attention-based speech recognition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Распознать набор файлов признаков (.npy, [frames, feat_dim], f32)
    Decode {
        /// Директория модели (config.json + model.safetensors)
        #[arg(long)]
        model: PathBuf,

        /// Файлы признаков; обрабатываются одним батчем
        #[arg(long, required = true, num_args = 1..)]
        features: Vec<PathBuf>,

        /// Словарь `{"token": id}` для сборки текста
        #[arg(long)]
        vocab: Option<PathBuf>,

        /// Файл с нелингвистическими символами, по одному на строку
        #[arg(long)]
        non_lang_syms: Option<PathBuf>,

        /// Количество шагов свободной генерации
        #[arg(long, default_value_t = 500)]
        max_steps: usize,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Печатать результат в JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Показать конфигурацию модели и число параметров
    Inspect {
        /// Директория модели или путь к config.json
        #[arg(long)]
        model: PathBuf,
    },

    /// Прогон на случайных весах и синтетическом входе
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

#[derive(Serialize)]
struct Hypothesis {
    id: String,
    frames: usize,
    tokens: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode {
            model,
            features,
            vocab,
            non_lang_syms,
            max_steps,
            device,
            json,
        } => run_decode(
            &model,
            &features,
            vocab.as_deref(),
            non_lang_syms.as_deref(),
            max_steps,
            &device,
            json,
        ),

        Commands::Inspect { model } => run_inspect(&model),

        Commands::Test { device } => run_test(&device),
    }
}

fn load_features(path: &Path) -> Result<Utterance> {
    let tensor = candle_core::Tensor::read_npy(path)
        .with_context(|| format!("Не удалось прочитать {}", path.display()))?;
    let tensor = tensor.to_dtype(candle_core::DType::F32)?;
    let (_, feat_dim) = tensor.dims2()?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let features = tensor.flatten_all()?.to_vec1::<f32>()?;
    Ok(Utterance::new(id, features, feat_dim, Vec::new())?)
}

fn load_vocab(vocab: Option<&Path>, non_lang_syms: Option<&Path>) -> Result<Option<Vocabulary>> {
    let Some(path) = vocab else {
        return Ok(None);
    };
    let mut vocab = Vocabulary::from_json_file(path)?;
    if let Some(syms_path) = non_lang_syms {
        let data = std::fs::read_to_string(syms_path)
            .with_context(|| format!("Не удалось прочитать {}", syms_path.display()))?;
        let syms: Vec<String> = data
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        vocab = vocab.with_non_lang_syms(syms);
    }
    Ok(Some(vocab))
}

fn run_decode(
    model_dir: &Path,
    feature_paths: &[PathBuf],
    vocab: Option<&Path>,
    non_lang_syms: Option<&Path>,
    max_steps: usize,
    device: &str,
    json: bool,
) -> Result<()> {
    let start = Instant::now();
    let device = create_device(device)?;
    let model = LasModel::load(model_dir, &device)?;
    let vocab = load_vocab(vocab, non_lang_syms)?;

    let utterances = feature_paths
        .iter()
        .map(|p| load_features(p))
        .collect::<Result<Vec<_>>>()?;
    let batch = collate(utterances, &device)?;
    info!(
        "Батч: {} высказываний, до {} фреймов",
        batch.batch_size(),
        batch.max_frames()
    );

    let hyps = model.recognize(&batch.features, &batch.lengths, max_steps)?;

    let results: Vec<Hypothesis> = batch
        .ids
        .iter()
        .zip(&batch.lengths)
        .zip(hyps)
        .map(|((id, &frames), tokens)| Hypothesis {
            id: id.clone(),
            frames,
            text: vocab.as_ref().map(|v| v.decode(&tokens)),
            tokens,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for r in &results {
            match &r.text {
                Some(text) => println!("{}\t{}", r.id, text),
                None => println!("{}\t{:?}", r.id, r.tokens),
            }
        }
    }
    info!("Готово за {:.2?}", start.elapsed());
    Ok(())
}

fn run_inspect(model: &Path) -> Result<()> {
    let config_path = if model.is_dir() {
        model.join("config.json")
    } else {
        model.to_path_buf()
    };
    let config = LasConfig::from_file(&config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("vocab_size: {}", config.vocab_size());
    println!("encoder_dim: {}", config.encoder_dim());
    println!("vgg_output_dim: {}", config.vgg_output_dim());
    println!("parameters: {:.2}M", config.num_parameters() as f64 / 1e6);
    Ok(())
}

fn run_test(device: &str) -> Result<()> {
    println!("🧪 RustLAS - Setup Test");
    println!("=======================");

    let device = create_device(device)?;
    let config = LasConfig {
        enc_hidden_dim: 32,
        enc_n_layers: 2,
        subsample: vec![1, 2],
        dec_hidden_dim: 32,
        att_dim: 16,
        conv_kernel_size: 11,
        att_odim: 32,
        output_dim: 30,
        ..LasConfig::wsj()
    };
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
    let model = LasModel::new(config.clone(), vb)?;

    let lens = [40usize, 28];
    let features = candle_core::Tensor::randn(0f32, 1f32, (2, lens[0], config.input_dim), &device)?;
    let targets = vec![vec![3, 4, 5, 6, 7], vec![8, 9, 10]];

    let out = model.forward(&features, &lens, Some(&targets), &DecodeOptions::default())?;
    println!("✅ Forced pass: log_probs {:?}, encoder lens {:?}", out.log_probs.dims(), out.encoder_lens);

    let opts = DecodeOptions::default().with_max_dec_timesteps(8);
    let out = model.forward(&features, &lens, None, &opts)?;
    println!("✅ Free-running pass: predictions {:?}", out.predictions.dims());
    Ok(())
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
