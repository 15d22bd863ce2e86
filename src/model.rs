use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::config::{Activation, ModelConfig, NormKind};

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape.dims())?;
    let m = mask.where_cond(&on_true, on_false)?;
    Ok(m)
}

fn linear_with_init(in_dim: usize, out_dim: usize, std: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        candle_nn::Init::Randn {
            mean: 0.0,
            stdev: std,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", candle_nn::Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        let x = x.broadcast_mul(&self.weight)?;
        x.broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        x.broadcast_mul(&self.weight)
    }
}

#[derive(Debug, Clone)]
pub enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl Norm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        match config.norm_method {
            NormKind::LayerNorm => Ok(Self::Layer(LayerNorm::new(
                config.n_embd,
                config.norm_eps,
                vb,
            )?)),
            NormKind::RmsNorm => Ok(Self::Rms(RmsNorm::new(config.n_embd, config.norm_eps, vb)?)),
        }
    }
}

impl Module for Norm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(x),
            Self::Rms(norm) => norm.forward(x),
        }
    }
}

/// Precomputed rotation tables, one angle per (position, channel pair).
pub struct RotaryCache {
    cos: Tensor,
    sin: Tensor,
    head_dim: usize,
    base: f64,
}

impl RotaryCache {
    pub fn new(head_dim: usize, base: f64, max_seq_len: usize, device: &Device) -> Result<Self> {
        if !head_dim.is_multiple_of(2) {
            candle_core::bail!("rotary encoding needs an even head dim, got {head_dim}")
        }
        let (cos, sin) = Self::tables(head_dim, base, max_seq_len, device)?;
        Ok(Self {
            cos,
            sin,
            head_dim,
            base,
        })
    }

    fn tables(head_dim: usize, base: f64, len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let half = head_dim / 2;
        let theta: Vec<f32> = (0..half)
            .map(|i| 1.0 / (base as f32).powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        let theta = Tensor::new(theta.as_slice(), device)?.reshape((1, half))?;
        let positions = Tensor::arange(0f32, len as f32, device)?.reshape((len, 1))?;
        let angles = positions.broadcast_mul(&theta)?;
        Ok((angles.cos()?, angles.sin()?))
    }

    /// Rotates consecutive channel pairs of a (batch, seq, heads, head_dim)
    /// tensor by the position's angle. Sequences longer than the cached
    /// tables get freshly computed tables instead of an error.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, h, d) = x.dims4()?;
        if d != self.head_dim {
            candle_core::bail!("rotary cache built for head dim {}, got {d}", self.head_dim)
        }
        let (cos, sin) = if t <= self.cos.dim(0)? {
            (self.cos.narrow(0, 0, t)?, self.sin.narrow(0, 0, t)?)
        } else {
            Self::tables(self.head_dim, self.base, t, x.device())?
        };
        let cos = cos.reshape((1, t, 1, d / 2, 1))?;
        let sin = sin.reshape((1, t, 1, d / 2, 1))?;

        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?.reshape((b, t, h, d / 2, 2))?;
        let x0 = x.narrow(D::Minus1, 0, 1)?;
        let x1 = x.narrow(D::Minus1, 1, 1)?;
        let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let out1 = (x1.broadcast_mul(&cos)? + x0.broadcast_mul(&sin)?)?;
        let rotated = Tensor::cat(&[&out0, &out1], D::Minus1)?;
        rotated.reshape((b, t, h, d))?.to_dtype(dtype)
    }
}

pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    rope: Option<RotaryCache>,
    #[cfg(feature = "flash-attn")]
    flash: bool,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c_attn = linear_with_init(config.n_embd, 3 * config.n_embd, 0.02, vb.pp("c_attn"))?;
        let c_proj = linear_with_init(
            config.n_embd,
            config.n_embd,
            config.residual_init_std(),
            vb.pp("c_proj"),
        )?;
        let rope = if config.use_rope {
            Some(RotaryCache::new(
                config.head_dim(),
                config.rope_base,
                config.block_size,
                vb.device(),
            )?)
        } else {
            None
        };
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            rope,
            #[cfg(feature = "flash-attn")]
            flash: config.flash,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, n_embd) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, n_embd)?;
        let k = qkv.narrow(D::Minus1, n_embd, n_embd)?;
        let v = qkv.narrow(D::Minus1, 2 * n_embd, n_embd)?;

        let q = q.reshape((batch_size, seq_len, self.n_head, self.head_dim))?;
        let k = k.reshape((batch_size, seq_len, self.n_head, self.head_dim))?;
        let v = v.reshape((batch_size, seq_len, self.n_head, self.head_dim))?;

        let (q, k) = match &self.rope {
            Some(rope) => (rope.apply(&q)?, rope.apply(&k)?),
            None => (q, k),
        };

        // Flash attention consumes the (batch, seq, heads, head_dim) layout.
        #[cfg(feature = "flash-attn")]
        if self.flash {
            let softmax_scale = 1.0 / (self.head_dim as f32).sqrt();
            let attn = candle_flash_attn::flash_attn(&q, &k, &v, softmax_scale, true)?;
            let attn = attn.reshape((batch_size, seq_len, n_embd))?;
            return self.c_proj.forward(&attn);
        }

        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;
        let attn_weights = masked_fill(&attn_weights, mask, f32::NEG_INFINITY)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let output = attn_weights.matmul(&v)?;
        let output = output.transpose(1, 2)?.contiguous()?;
        let output = output.reshape((batch_size, seq_len, n_embd))?;
        self.c_proj.forward(&output)
    }
}

pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    activation: Activation,
}

impl Mlp {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = 4 * config.n_embd;
        let fc_out = match config.activation {
            Activation::Gelu => hidden,
            // The expansion doubles so half of it can gate the other half.
            Activation::SwiGlu => 2 * hidden,
        };
        let c_fc = linear_with_init(config.n_embd, fc_out, 0.02, vb.pp("c_fc"))?;
        let c_proj = linear_with_init(
            hidden,
            config.n_embd,
            config.residual_init_std(),
            vb.pp("c_proj"),
        )?;
        Ok(Self {
            c_fc,
            c_proj,
            activation: config.activation,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?;
        let x = match self.activation {
            Activation::Gelu => x.gelu()?,
            Activation::SwiGlu => {
                let hidden = x.dim(D::Minus1)? / 2;
                let value = x.narrow(D::Minus1, 0, hidden)?;
                let gate = x.narrow(D::Minus1, hidden, hidden)?;
                value.mul(&candle_nn::ops::sigmoid(&gate)?)?
            }
        };
        self.c_proj.forward(&x)
    }
}

pub struct Block {
    ln_1: Norm,
    attn: CausalSelfAttention,
    ln_2: Norm,
    mlp: Mlp,
}

impl Block {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: Norm::new(config, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: Norm::new(config, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok(x)
    }
}

pub struct Gpt {
    wte: Embedding,
    wpe: Option<Embedding>,
    blocks: Vec<Block>,
    ln_f: Norm,
    lm_head: Linear,
    mask: Tensor,
    config: ModelConfig,
}

impl Gpt {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        if config.flash && !cfg!(feature = "flash-attn") {
            tracing::warn!(
                "config asks for flash attention but the flash-attn feature is not compiled in, using the masked path"
            );
        }

        let wte_weight = vb.pp("wte").get_with_hints(
            (config.vocab_size, config.n_embd),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let wte = Embedding::new(wte_weight.clone(), config.n_embd);
        // The output head shares the embedding storage: one tensor, two roles.
        let lm_head = Linear::new(wte_weight, None);

        let wpe = if config.use_rope {
            None
        } else {
            let weight = vb.pp("wpe").get_with_hints(
                (config.block_size, config.n_embd),
                "weight",
                candle_nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?;
            Some(Embedding::new(weight, config.n_embd))
        };

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::new(config, vb.pp(format!("h.{}", i)))?);
        }
        let ln_f = Norm::new(config, vb.pp("ln_f"))?;
        let mask = causal_mask(config.block_size, vb.device())?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            mask,
            config: config.clone(),
        })
    }

    /// Runs the stack. With targets, also returns the mean cross-entropy
    /// over every position.
    pub fn forward(
        &self,
        tokens: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_batch_size, seq_len) = tokens.dims2()?;
        if seq_len > self.config.block_size {
            candle_core::bail!(
                "sequence length {seq_len} exceeds block size {}",
                self.config.block_size
            )
        }

        let mut x = self.wte.forward(tokens)?;
        if let Some(wpe) = &self.wpe {
            let positions = Tensor::arange(0u32, seq_len as u32, tokens.device())?;
            x = x.broadcast_add(&wpe.forward(&positions)?)?;
        }

        let mask = self.mask.narrow(2, 0, seq_len)?.narrow(3, 0, seq_len)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;

        let loss = match targets {
            Some(targets) => Some(cross_entropy_loss(&logits, targets)?),
            None => None,
        };
        Ok((logits, loss))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }
}

fn causal_mask(block_size: usize, device: &Device) -> Result<Tensor> {
    // 1 marks a position attention must not see.
    let mut mask_data = vec![0u8; block_size * block_size];
    for i in 0..block_size {
        for j in (i + 1)..block_size {
            mask_data[i * block_size + j] = 1;
        }
    }
    Tensor::from_vec(mask_data, (1, 1, block_size, block_size), device)
}

pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits
        .reshape((batch_size * seq_len, vocab_size))?
        .to_dtype(DType::F32)?;
    let targets = targets.reshape((batch_size * seq_len,))?;
    candle_nn::loss::cross_entropy(&logits, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            block_size: 8,
            vocab_size: 16,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            ..ModelConfig::nano()
        }
    }

    fn build(config: &ModelConfig) -> Result<(Gpt, VarMap)> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = Gpt::new(config, vb)?;
        Ok((model, var_map))
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let config = tiny_config();
        let (model, _var_map) = build(&config)?;
        let tokens = Tensor::zeros((2, 8), DType::U32, &Device::Cpu)?;
        let (logits, loss) = model.forward(&tokens, None)?;
        assert_eq!(logits.dims(), &[2, 8, 16]);
        assert!(loss.is_none());

        let targets = Tensor::ones((2, 8), DType::U32, &Device::Cpu)?;
        let (_, loss) = model.forward(&tokens, Some(&targets))?;
        let loss = loss.unwrap().to_scalar::<f32>()?;
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
        Ok(())
    }

    #[test]
    fn test_sequence_length_limit() -> Result<()> {
        let config = tiny_config();
        let (model, _var_map) = build(&config)?;
        let tokens = Tensor::zeros((1, 9), DType::U32, &Device::Cpu)?;
        let err = model.forward(&tokens, None).unwrap_err().to_string();
        assert!(err.contains('9'), "missing sequence length in {err}");
        assert!(err.contains('8'), "missing block size in {err}");
        Ok(())
    }

    #[test]
    fn test_future_tokens_do_not_change_past_logits() -> Result<()> {
        let config = tiny_config();
        let (model, _var_map) = build(&config)?;
        let a = Tensor::from_slice(&[1u32, 2, 3, 4, 5, 6], (1, 6), &Device::Cpu)?;
        let b = Tensor::from_slice(&[1u32, 2, 3, 4, 5, 15], (1, 6), &Device::Cpu)?;
        let (logits_a, _) = model.forward(&a, None)?;
        let (logits_b, _) = model.forward(&b, None)?;
        // Positions before the edit must be identical.
        let head_a = logits_a.narrow(1, 0, 5)?.flatten_all()?.to_vec1::<f32>()?;
        let head_b = logits_b.narrow(1, 0, 5)?.flatten_all()?.to_vec1::<f32>()?;
        for (x, y) in head_a.iter().zip(head_b.iter()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
        Ok(())
    }

    #[test]
    fn test_output_head_shares_embedding_storage() -> Result<()> {
        let config = tiny_config();
        let (model, var_map) = build(&config)?;
        {
            let data = var_map.data().lock().unwrap();
            let wte = data.get("wte.weight").unwrap();
            let zeros = Tensor::zeros(wte.dims(), DType::F32, &Device::Cpu)?;
            wte.set(&zeros)?;
        }
        // A zeroed embedding zeroes the tied head, so every logit is zero.
        let tokens = Tensor::from_slice(&[3u32, 1, 4], (1, 3), &Device::Cpu)?;
        let (logits, _) = model.forward(&tokens, None)?;
        let total = logits.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(total, 0.0);
        Ok(())
    }

    #[test]
    fn test_lm_head_not_in_var_map() -> Result<()> {
        let config = tiny_config();
        let (_model, var_map) = build(&config)?;
        let data = var_map.data().lock().unwrap();
        assert!(data.contains_key("wte.weight"));
        assert!(!data.keys().any(|name| name.contains("lm_head")));
        Ok(())
    }

    #[test]
    fn test_rotary_position_zero_is_identity() -> Result<()> {
        let cache = RotaryCache::new(8, 10000.0, 16, &Device::Cpu)?;
        let x = Tensor::rand(-1.0f32, 1.0, (1, 4, 2, 8), &Device::Cpu)?;
        let rotated = cache.apply(&x)?;
        let first = x.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let first_rot = rotated.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in first.iter().zip(first_rot.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn test_rotary_preserves_pair_magnitude() -> Result<()> {
        let cache = RotaryCache::new(8, 10000.0, 16, &Device::Cpu)?;
        let x = Tensor::rand(-1.0f32, 1.0, (2, 8, 2, 8), &Device::Cpu)?;
        let rotated = cache.apply(&x)?;
        let norms = x.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        let rot_norms = rotated
            .sqr()?
            .sum(D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for (a, b) in norms.iter().zip(rot_norms.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        Ok(())
    }

    // Negating the second channel of every pair turns the cached rotation
    // into its inverse: R(-t) = N . R(t) . N.
    fn negate_pair_seconds(x: &Tensor) -> Result<Tensor> {
        let (b, t, h, d) = x.dims4()?;
        let pairs = x.reshape((b, t, h, d / 2, 2))?;
        let first = pairs.narrow(D::Minus1, 0, 1)?;
        let second = pairs.narrow(D::Minus1, 1, 1)?.neg()?;
        Tensor::cat(&[&first, &second], D::Minus1)?.reshape((b, t, h, d))
    }

    #[test]
    fn test_rotary_inverse_rotation_restores_the_input() -> Result<()> {
        let cache = RotaryCache::new(8, 10000.0, 16, &Device::Cpu)?;
        let x = Tensor::rand(-1.0f32, 1.0, (2, 16, 2, 8), &Device::Cpu)?;
        let rotated = cache.apply(&x)?;
        let back = negate_pair_seconds(&cache.apply(&negate_pair_seconds(&rotated)?)?)?;

        let original = x.flatten_all()?.to_vec1::<f32>()?;
        let restored = back.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in original.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn test_rotary_grows_past_cached_length() -> Result<()> {
        let cache = RotaryCache::new(4, 10000.0, 4, &Device::Cpu)?;
        let x = Tensor::rand(-1.0f32, 1.0, (1, 10, 1, 4), &Device::Cpu)?;
        let rotated = cache.apply(&x)?;
        assert_eq!(rotated.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn test_causal_mask_values() -> Result<()> {
        let mask = causal_mask(4, &Device::Cpu)?;
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        #[rustfmt::skip]
        let expected = [
            0, 1, 1, 1,
            0, 0, 1, 1,
            0, 0, 0, 1,
            0, 0, 0, 0,
        ];
        assert_eq!(values, expected);
        Ok(())
    }

    #[test]
    fn test_gelu_uses_tanh_approximation() -> Result<()> {
        let inputs = [-2.0f32, -0.5, 0.0, 0.5, 1.0, 2.0];
        let x = Tensor::new(&inputs[..], &Device::Cpu)?;
        let got = x.gelu()?.to_vec1::<f32>()?;
        for (x, y) in inputs.iter().zip(got.iter()) {
            let inner = (2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x);
            let expected = 0.5 * x * (1.0 + inner.tanh());
            assert!((expected - y).abs() < 1e-5, "{expected} vs {y}");
        }
        Ok(())
    }

    #[test]
    fn test_swiglu_expansion_and_projection_shapes() -> Result<()> {
        let config = ModelConfig {
            activation: Activation::SwiGlu,
            ..tiny_config()
        };
        let (model, var_map) = build(&config)?;
        {
            let data = var_map.data().lock().unwrap();
            assert_eq!(
                data.get("h.0.mlp.c_fc.weight").unwrap().dims(),
                &[8 * config.n_embd, config.n_embd]
            );
            assert_eq!(
                data.get("h.0.mlp.c_proj.weight").unwrap().dims(),
                &[config.n_embd, 4 * config.n_embd]
            );
        }
        let tokens = Tensor::zeros((1, 4), DType::U32, &Device::Cpu)?;
        let (logits, _) = model.forward(&tokens, None)?;
        assert_eq!(logits.dims(), &[1, 4, config.vocab_size]);
        Ok(())
    }

    #[test]
    fn test_rope_model_has_no_position_table() -> Result<()> {
        let config = ModelConfig {
            use_rope: true,
            ..tiny_config()
        };
        let (_model, var_map) = build(&config)?;
        let data = var_map.data().lock().unwrap();
        assert!(!data.contains_key("wpe.weight"));
        Ok(())
    }

    #[test]
    fn test_residual_projections_use_scaled_init() -> Result<()> {
        // With many layers the residual-exit std shrinks; spot-check the
        // sample std lands near the target for both projection kinds.
        let config = ModelConfig {
            block_size: 8,
            vocab_size: 16,
            n_layer: 8,
            n_head: 2,
            n_embd: 64,
            ..ModelConfig::nano()
        };
        let (_model, var_map) = build(&config)?;
        let data = var_map.data().lock().unwrap();
        let std_of = |name: &str| -> Result<f32> {
            let t = data.get(name).unwrap().flatten_all()?.to_vec1::<f32>()?;
            let mean = t.iter().sum::<f32>() / t.len() as f32;
            let var = t.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / t.len() as f32;
            Ok(var.sqrt())
        };
        let expected = (0.02 / ((2 * config.n_layer) as f64).sqrt()) as f32;
        for name in ["h.0.attn.c_proj.weight", "h.0.mlp.c_proj.weight"] {
            let std = std_of(name)?;
            assert!(
                (std - expected).abs() < expected * 0.2,
                "{name}: std {std} vs expected {expected}"
            );
        }
        let base_std = std_of("h.0.attn.c_attn.weight")?;
        assert!((base_std - 0.02).abs() < 0.004, "c_attn std {base_std}");
        Ok(())
    }
}
