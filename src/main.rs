use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use smelt::config::{ModelConfig, RunConfig, TrainConfig};
use smelt::data::TokenLoader;
use smelt::distributed::{DistributedContext, DistributedOptions};
use smelt::pretrained;
use smelt::sample::Sampler;
use smelt::training::Trainer;

#[derive(Parser)]
#[command(name = "smelt")]
#[command(about = "Train GPT-2 style language models from scratch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on binary token shards
    Train {
        /// Path to a run configuration JSON (flags below override it)
        #[arg(short, long)]
        config: Option<String>,

        /// Model configuration preset (gpt2, gpt2-medium, gpt2-large, gpt2-xl, nano)
        #[arg(short, long, default_value = "gpt2")]
        model: String,

        /// Path to the training token shard (.bin, .bin.gz or .bin.zst)
        #[arg(long)]
        train_data: String,

        /// Path to the validation token shard
        #[arg(long)]
        val_data: String,

        /// Output directory for checkpoints and the run log
        #[arg(short, long)]
        output: Option<String>,

        /// Start from a previously saved safetensors checkpoint
        #[arg(long)]
        init_from: Option<String>,

        /// Maximum learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Micro-batch size per rank
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Sequence length per micro-batch
        #[arg(long)]
        seq_len: Option<usize>,

        /// Number of optimizer steps
        #[arg(long)]
        num_iterations: Option<usize>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,

        /// GPU device index (for multi-GPU systems)
        #[arg(long, default_value = "0")]
        gpu_id: usize,

        /// World size for distributed training (number of GPUs)
        #[arg(long, default_value = "1")]
        world_size: usize,

        /// Rank for distributed training (0 to world_size-1)
        #[arg(long, default_value = "0")]
        rank: usize,

        /// Communication file for NCCL ID exchange
        #[arg(long, default_value = "nccl_id.txt")]
        comm_file: String,
    },

    /// Sample tokens from a trained checkpoint
    Sample {
        /// Path to a safetensors checkpoint
        #[arg(short, long)]
        checkpoint: String,

        /// Path to the run configuration JSON the checkpoint was trained with
        #[arg(long)]
        config: Option<String>,

        /// Model configuration preset when no config file is given
        #[arg(short, long, default_value = "gpt2")]
        model: String,

        /// Comma separated prompt token ids
        #[arg(short, long, default_value = "0")]
        prompt: String,

        /// Maximum number of tokens to generate
        #[arg(long, default_value = "100")]
        max_tokens: usize,

        /// Sampling temperature (0 for greedy decoding)
        #[arg(long, default_value = "0.8")]
        temperature: f64,

        /// Top-k sampling
        #[arg(long)]
        top_k: Option<usize>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,
    },

    /// Convert a Hugging Face GPT-2 safetensors checkpoint into a training checkpoint
    Import {
        /// Path to the GPT-2 model.safetensors file
        #[arg(short, long)]
        source: String,

        /// Model configuration preset matching the checkpoint
        #[arg(short, long, default_value = "gpt2")]
        model: String,

        /// Output path for the converted checkpoint
        #[arg(short, long)]
        output: String,
    },

    /// Show model info
    Info {
        /// Model configuration preset
        #[arg(short, long, default_value = "gpt2")]
        model: String,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn get_config(name: &str) -> Result<ModelConfig> {
    ModelConfig::preset(name).with_context(|| {
        format!("unknown model preset '{name}', expected gpt2, gpt2-medium, gpt2-large, gpt2-xl or nano")
    })
}

fn resolve_run_config(config: &Option<String>, model: &str) -> Result<RunConfig> {
    match config {
        Some(path) => RunConfig::from_json(Path::new(path)),
        None => Ok(RunConfig {
            model: get_config(model)?,
            training: TrainConfig::default(),
        }),
    }
}

fn parse_prompt(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(|piece| {
            let piece = piece.trim();
            piece
                .parse::<u32>()
                .with_context(|| format!("invalid prompt token '{piece}'"))
        })
        .collect()
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config: config_path,
            model,
            train_data,
            val_data,
            output,
            init_from,
            lr,
            batch_size,
            seq_len,
            num_iterations,
            gpu,
            gpu_id,
            world_size,
            rank,
            comm_file,
        } => {
            let mut config = resolve_run_config(&config_path, &model)?;
            if let Some(output) = output {
                config.training.output_dir = output;
            }
            if let Some(lr) = lr {
                config.training.learning_rate = lr;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(seq_len) = seq_len {
                config.training.sequence_length = seq_len;
            }
            if let Some(num_iterations) = num_iterations {
                config.training.num_iterations = num_iterations;
            }

            // With several ranks on one host, each rank drives its own GPU.
            let actual_gpu_id = if world_size > 1 { rank } else { gpu_id };
            let device = get_device(gpu, actual_gpu_id)?;

            let ctx = DistributedContext::new(&DistributedOptions {
                rank,
                world_size,
                comm_file: comm_file.into(),
                gpu_id: actual_gpu_id,
            })?;
            if ctx.is_distributed() {
                info!("Distributed training: rank {}/{}", ctx.rank(), ctx.world_size());
            }
            info!("Using device: {:?}", device);

            let batch_size = config.training.batch_size;
            let sequence_length = config.training.sequence_length;
            let mut train_loader = TokenLoader::new(
                &train_data,
                batch_size,
                sequence_length,
                ctx.rank(),
                ctx.world_size(),
            )?;
            let mut val_loader = TokenLoader::new(
                &val_data,
                batch_size,
                sequence_length,
                ctx.rank(),
                ctx.world_size(),
            )?;

            let is_master = ctx.is_master();
            let mut trainer = Trainer::new(config, ctx, device)?;
            if let Some(path) = &init_from {
                trainer.load_weights(Path::new(path))?;
            }
            trainer.run(&mut train_loader, &mut val_loader)?;
            trainer.shutdown()?;

            if is_master {
                info!("Training complete!");
            }
        }

        Commands::Sample {
            checkpoint,
            config: config_path,
            model,
            prompt,
            max_tokens,
            temperature,
            top_k,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let config = resolve_run_config(&config_path, &model)?;
            let mut var_map = candle_nn::VarMap::new();
            let vb = candle_nn::VarBuilder::from_varmap(
                &var_map,
                config.training.compute_dtype(),
                &device,
            );
            let gpt = smelt::Gpt::new(&config.model, vb)?;
            var_map
                .load(&checkpoint)
                .with_context(|| format!("loading checkpoint {checkpoint}"))?;
            info!("Loaded model from {}", checkpoint);

            let prompt_tokens = parse_prompt(&prompt)?;
            let sampler = Sampler::new(&gpt, &device);
            let tokens = sampler.generate(&prompt_tokens, max_tokens, temperature, top_k)?;

            let rendered: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
            println!("{}", rendered.join(" "));
        }

        Commands::Import {
            source,
            model,
            output,
        } => {
            let config = get_config(&model)?;
            let (_, var_map) = pretrained::import_gpt2(Path::new(&source), &config, &Device::Cpu)?;
            var_map.save(&output)?;
            info!(
                "Imported {} into {} ({} tensors)",
                source,
                output,
                pretrained::expected_var_names(&config).len()
            );
        }

        Commands::Info { model } => {
            let config = get_config(&model)?;
            println!("Model: {}", model);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Block size: {}", config.block_size);
            println!("  Layers: {}", config.n_layer);
            println!("  Heads: {}", config.n_head);
            println!("  Embedding dim: {}", config.n_embd);
            println!("  Head dimension: {}", config.head_dim());
            println!("  Norm: {:?}", config.norm_method);
            println!("  Activation: {:?}", config.activation);
            println!("  Rotary embeddings: {}", config.use_rope);
            let total = config.num_parameters();
            println!(
                "  Parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
