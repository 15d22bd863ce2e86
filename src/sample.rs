//! Autoregressive sampling from a trained model, for eyeballing
//! checkpoints. One token per forward pass over a sliding context
//! window.

use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use rand::Rng;

use crate::model::Gpt;

pub struct Sampler<'a> {
    model: &'a Gpt,
    device: &'a Device,
}

impl<'a> Sampler<'a> {
    pub fn new(model: &'a Gpt, device: &'a Device) -> Self {
        Self { model, device }
    }

    /// Extends `prompt` by `max_new_tokens` sampled tokens and returns
    /// the whole sequence, prompt included. A temperature of zero (or
    /// below) switches to greedy decoding; a `top_k` of zero, or one at
    /// least the vocabulary size, disables the top-k filter.
    pub fn generate(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
    ) -> Result<Vec<u32>> {
        ensure!(!prompt.is_empty(), "the prompt must hold at least one token");
        let vocab_size = self.model.config().vocab_size;
        if let Some(&bad) = prompt.iter().find(|&&t| t as usize >= vocab_size) {
            bail!("prompt token {bad} is out of range for vocab_size {vocab_size}");
        }

        let block_size = self.model.block_size();
        let mut rng = rand::rng();
        let mut tokens = prompt.to_vec();
        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(block_size);
            let context = &tokens[start..];
            let input = Tensor::from_slice(context, (1, context.len()), self.device)?;
            let (logits, _) = self.model.forward(&input, None)?;
            let last = logits
                .narrow(1, context.len() - 1, 1)?
                .squeeze(1)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            let next = if temperature <= 0.0 {
                argmax(&last.to_vec1::<f32>()?)
            } else {
                let scaled = last.affine(1.0 / temperature, 0.0)?;
                let mut values = scaled.to_vec1::<f32>()?;
                if let Some(k) = top_k {
                    keep_top_k(&mut values, k);
                }
                let masked = Tensor::from_vec(values, vocab_size, self.device)?;
                let probs = softmax_last_dim(&masked)?.to_vec1::<f32>()?;
                let r: f32 = rng.random();
                probs
                    .iter()
                    .scan(0f32, |cdf, &p| {
                        *cdf += p;
                        Some(*cdf)
                    })
                    .position(|cdf| cdf > r)
                    .unwrap_or(vocab_size - 1)
            };
            tokens.push(next as u32);
        }
        Ok(tokens)
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Pushes everything below the k-th largest value to negative infinity,
/// so the following softmax zeroes it out.
fn keep_top_k(values: &mut [f32], k: usize) {
    if k == 0 || k >= values.len() {
        return;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for v in values.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}
