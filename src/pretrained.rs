//! Imports GPT-2 weights from a safetensors file laid out the way the
//! Hugging Face checkpoints are.
//!
//! The checkpoint stores the four projection matrices as Conv1D weights,
//! i.e. transposed relative to a linear layer, so those are flipped on
//! the way in. Attention mask buffers are dropped; everything else must
//! match the model tensor for tensor, by name and by shape.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{Activation, ModelConfig, NormKind};
use crate::model::Gpt;

/// Checkpoint weights stored input-major; a linear layer wants them
/// output-major.
const TRANSPOSED: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

fn is_transposed(name: &str) -> bool {
    TRANSPOSED.iter().any(|suffix| name.ends_with(suffix))
}

/// Every parameter name a GPT-2 shaped model owns, in checkpoint order.
/// The output head is absent: it shares storage with `wte.weight`.
pub fn expected_var_names(config: &ModelConfig) -> Vec<String> {
    let mut names = vec!["wte.weight".to_string(), "wpe.weight".to_string()];
    for layer in 0..config.n_layer {
        for suffix in [
            "ln_1.weight",
            "ln_1.bias",
            "attn.c_attn.weight",
            "attn.c_attn.bias",
            "attn.c_proj.weight",
            "attn.c_proj.bias",
            "ln_2.weight",
            "ln_2.bias",
            "mlp.c_fc.weight",
            "mlp.c_fc.bias",
            "mlp.c_proj.weight",
            "mlp.c_proj.bias",
        ] {
            names.push(format!("h.{layer}.{suffix}"));
        }
    }
    names.push("ln_f.weight".to_string());
    names.push("ln_f.bias".to_string());
    names
}

/// GPT-2 checkpoints only fit models with the GPT-2 architecture knobs.
pub fn ensure_gpt2_compatible(config: &ModelConfig) -> Result<()> {
    ensure!(
        config.norm_method == NormKind::LayerNorm,
        "a GPT-2 checkpoint carries layernorm weights, the model is configured for {:?}",
        config.norm_method
    );
    ensure!(
        config.activation == Activation::Gelu,
        "a GPT-2 checkpoint carries a plain MLP, the model is configured for {:?}",
        config.activation
    );
    ensure!(
        !config.use_rope,
        "a GPT-2 checkpoint carries learned position embeddings, the model is configured for rotary embeddings"
    );
    Ok(())
}

/// Builds a model and overwrites its parameters with the checkpoint at
/// `source`.
pub fn import_gpt2(
    source: &Path,
    config: &ModelConfig,
    device: &Device,
) -> Result<(Gpt, VarMap)> {
    ensure_gpt2_compatible(config)?;
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, candle_core::DType::F32, device);
    let model = Gpt::new(config, vb)?;

    let tensors = candle_core::safetensors::load(source, device)
        .with_context(|| format!("reading checkpoint {}", source.display()))?;
    apply_weights(&var_map, config, tensors)?;
    Ok((model, var_map))
}

fn apply_weights(
    var_map: &VarMap,
    config: &ModelConfig,
    mut source: HashMap<String, Tensor>,
) -> Result<()> {
    // The causal mask ships inside the checkpoint as a buffer; it is not
    // a parameter.
    source.retain(|name, _| {
        !name.ends_with(".attn.bias") && !name.ends_with(".attn.masked_bias")
    });

    let expected = expected_var_names(config);
    ensure!(
        source.len() == expected.len(),
        "checkpoint holds {} parameter tensors, the model wants {}",
        source.len(),
        expected.len()
    );

    let vars = var_map.data().lock().unwrap();
    for name in &expected {
        let var = vars
            .get(name)
            .with_context(|| format!("the model has no parameter named {name}"))?;
        let tensor = source
            .remove(name)
            .with_context(|| format!("checkpoint is missing {name}"))?;
        let tensor = if is_transposed(name) {
            tensor.t()?.contiguous()?
        } else {
            tensor
        };
        ensure!(
            tensor.dims() == var.dims(),
            "shape mismatch for {name}: checkpoint {:?}, model {:?}",
            tensor.dims(),
            var.dims()
        );
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    Ok(())
}
