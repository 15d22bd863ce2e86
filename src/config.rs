//! Model architecture and training run configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::DType;
use candle_nn::ParamsAdamW;
use serde::{Deserialize, Serialize};

/// Normalization applied inside every block and after the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

/// Feed-forward nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Tanh-approximated GELU, the GPT-2 choice.
    Gelu,
    /// Gated unit: the expansion doubles and half of it gates the other.
    SwiGlu,
}

/// Dtype the model computes in. Reductions, normalization statistics and
/// the loss always run in f32 regardless of this setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    #[default]
    F32,
    Bf16,
}

impl ComputeDtype {
    pub fn to_dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Architecture of the transformer. Presets cover the GPT-2 family; the
/// switches select the normalization, the feed-forward variant and the
/// positional encoding without touching the overall layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum sequence length the model accepts.
    pub block_size: usize,
    /// Number of token ids the embedding and the output head cover.
    pub vocab_size: usize,
    /// Number of transformer blocks.
    pub n_layer: usize,
    /// Attention heads per block.
    pub n_head: usize,
    /// Embedding width.
    pub n_embd: usize,
    #[serde(default = "default_norm_method")]
    pub norm_method: NormKind,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    /// Rotary position encoding instead of a learned position table.
    #[serde(default)]
    pub use_rope: bool,
    /// Fused attention kernel when compiled with the `flash-attn` feature.
    #[serde(default)]
    pub flash: bool,
    #[serde(default = "default_rope_base")]
    pub rope_base: f64,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_norm_method() -> NormKind {
    NormKind::LayerNorm
}

fn default_activation() -> Activation {
    Activation::Gelu
}

fn default_rope_base() -> f64 {
    10000.0
}

fn default_norm_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    /// GPT-2 small, 124M parameters.
    pub fn gpt2() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50257,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            norm_method: NormKind::LayerNorm,
            activation: Activation::Gelu,
            use_rope: false,
            flash: false,
            rope_base: 10000.0,
            norm_eps: 1e-5,
        }
    }

    /// GPT-2 medium, 350M parameters.
    pub fn gpt2_medium() -> Self {
        Self {
            n_layer: 24,
            n_head: 16,
            n_embd: 1024,
            ..Self::gpt2()
        }
    }

    /// GPT-2 large, 774M parameters.
    pub fn gpt2_large() -> Self {
        Self {
            n_layer: 36,
            n_head: 20,
            n_embd: 1280,
            ..Self::gpt2()
        }
    }

    /// GPT-2 XL, 1.5B parameters.
    pub fn gpt2_xl() -> Self {
        Self {
            n_layer: 48,
            n_head: 25,
            n_embd: 1600,
            ..Self::gpt2()
        }
    }

    /// Small enough to train on a laptop CPU, handy for smoke runs.
    pub fn nano() -> Self {
        Self {
            block_size: 64,
            vocab_size: 256,
            n_layer: 2,
            n_head: 2,
            n_embd: 32,
            ..Self::gpt2()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "gpt2" => Some(Self::gpt2()),
            "gpt2-medium" => Some(Self::gpt2_medium()),
            "gpt2-large" => Some(Self::gpt2_large()),
            "gpt2-xl" => Some(Self::gpt2_xl()),
            "nano" => Some(Self::nano()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Init std for projections that feed a residual stream. Scaled down
    /// so the stream's variance stays flat across depth.
    pub fn residual_init_std(&self) -> f64 {
        0.02 / ((2 * self.n_layer) as f64).sqrt()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.n_layer > 0, "n_layer must be positive");
        ensure!(self.n_head > 0, "n_head must be positive");
        ensure!(
            self.n_embd.is_multiple_of(self.n_head),
            "n_embd {} is not divisible by n_head {}",
            self.n_embd,
            self.n_head
        );
        if self.use_rope {
            ensure!(
                self.head_dim().is_multiple_of(2),
                "rotary encoding needs an even head dim, got {} from n_embd {} / n_head {}",
                self.head_dim(),
                self.n_embd,
                self.n_head
            );
        }
        Ok(())
    }

    /// Trainable parameter count, with the tied embedding counted once.
    pub fn num_parameters(&self) -> usize {
        let c = self.n_embd;
        let norm = match self.norm_method {
            NormKind::LayerNorm => 2 * c,
            NormKind::RmsNorm => c,
        };
        let attn = (c * 3 * c + 3 * c) + (c * c + c);
        let fc_out = match self.activation {
            Activation::Gelu => 4 * c,
            Activation::SwiGlu => 8 * c,
        };
        let mlp = (c * fc_out + fc_out) + (4 * c * c + c);
        let block = 2 * norm + attn + mlp;
        let wpe = if self.use_rope { 0 } else { self.block_size * c };
        self.vocab_size * c + wpe + self.n_layer * block + norm
    }
}

/// Knobs of one training run. Every field falls back to its default when
/// absent from a config file, so a file can carry just the overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Micro-batch rows per process.
    pub batch_size: usize,
    /// Tokens per row.
    pub sequence_length: usize,
    /// Tokens consumed per optimizer step, summed over every process.
    /// Must be a multiple of `batch_size * sequence_length * world_size`;
    /// the quotient is the gradient accumulation depth.
    pub total_batch_size: usize,
    /// Macro-steps to run. The step loop is inclusive, so the run ends
    /// with a final validation pass at this index.
    pub num_iterations: usize,
    /// Validate (and checkpoint) every this many steps.
    pub val_loss_every: usize,
    /// Batches averaged per validation pass.
    pub val_max_steps: usize,
    pub learning_rate: f64,
    /// Cosine floor as a fraction of the peak rate.
    pub learning_rate_decay_frac: f64,
    pub warmup_iters: usize,
    /// Global gradient-norm ceiling.
    pub grad_clip: f64,
    /// Applied to rank >= 2 parameters only.
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub dtype: ComputeDtype,
    /// Checkpoints, `config.json` and `main.log` land here.
    pub output_dir: String,
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            sequence_length: 64,
            total_batch_size: 256,
            num_iterations: 50,
            val_loss_every: 20,
            val_max_steps: 20,
            learning_rate: 6e-4,
            learning_rate_decay_frac: 0.1,
            warmup_iters: 10,
            grad_clip: 1.0,
            weight_decay: 0.1,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            dtype: ComputeDtype::F32,
            output_dir: "out".to_string(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.sequence_length > 0, "sequence_length must be positive");
        // Zero divides everything, so the divisibility check alone
        // would wave it through with an accumulation depth of zero.
        ensure!(self.total_batch_size > 0, "total_batch_size must be positive");
        ensure!(self.num_iterations > 0, "num_iterations must be positive");
        ensure!(self.val_loss_every > 0, "val_loss_every must be positive");
        ensure!(self.val_max_steps > 0, "val_max_steps must be positive");
        ensure!(self.grad_clip > 0.0, "grad_clip must be positive");
        ensure!(
            self.warmup_iters <= self.num_iterations,
            "warmup_iters {} exceeds num_iterations {}",
            self.warmup_iters,
            self.num_iterations
        );
        Ok(())
    }

    /// Micro-batches per optimizer step for the given world size.
    pub fn grad_accum_steps(&self, world_size: usize) -> Result<usize> {
        let tokens_per_micro_step = self.batch_size * self.sequence_length * world_size;
        ensure!(
            self.total_batch_size.is_multiple_of(tokens_per_micro_step),
            "total_batch_size {} is not divisible by batch_size * sequence_length * world_size = {}",
            self.total_batch_size,
            tokens_per_micro_step
        );
        Ok(self.total_batch_size / tokens_per_micro_step)
    }

    pub fn compute_dtype(&self) -> DType {
        self.dtype.to_dtype()
    }

    pub fn adamw_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

/// Everything one run needs, round-trippable through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainConfig,
}

impl RunConfig {
    pub fn from_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.model.validate()?;
        config.training.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}
