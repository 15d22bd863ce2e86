//! Optimizer plumbing: the weight-decay parameter partition, a grouped
//! AdamW, gradient accumulation and global-norm clipping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

/// VarMap entries sorted by name. The map iterates in hash order, which
/// differs between processes; every place that walks the parameters in a
/// collective (or feeds one) must use this ordering instead.
pub fn named_vars_sorted(var_map: &VarMap) -> Vec<(String, Var)> {
    let data = var_map.data().lock().unwrap();
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Matrices (and anything of higher rank) get weight decay; vectors and
/// scalars, i.e. biases and norm scales, do not.
pub struct ParamGroups {
    pub decay: Vec<Var>,
    pub no_decay: Vec<Var>,
}

impl ParamGroups {
    pub fn partition(var_map: &VarMap) -> Self {
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();
        for (_, var) in named_vars_sorted(var_map) {
            if var.rank() >= 2 {
                decay.push(var);
            } else {
                no_decay.push(var);
            }
        }
        Self { decay, no_decay }
    }

    pub fn decay_elem_count(&self) -> usize {
        self.decay.iter().map(|v| v.elem_count()).sum()
    }

    pub fn no_decay_elem_count(&self) -> usize {
        self.no_decay.iter().map(|v| v.elem_count()).sum()
    }
}

/// Two AdamW instances sharing rate, betas and eps; only the decay group
/// carries the configured weight decay.
pub struct GroupedAdamW {
    decay: AdamW,
    no_decay: AdamW,
}

impl GroupedAdamW {
    pub fn new(groups: ParamGroups, params: ParamsAdamW) -> Result<Self> {
        let no_decay_params = ParamsAdamW {
            weight_decay: 0.0,
            ..params.clone()
        };
        Ok(Self {
            decay: AdamW::new(groups.decay, params)?,
            no_decay: AdamW::new(groups.no_decay, no_decay_params)?,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.decay.step(grads)?;
        self.no_decay.step(grads)
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    pub fn learning_rate(&self) -> f64 {
        self.decay.learning_rate()
    }
}

/// Folds the gradients of one micro-batch into the running store. The
/// first micro-batch donates its whole store; later ones are summed in
/// tensor by tensor.
pub fn accumulate_grads(
    acc: &mut Option<GradStore>,
    fresh: GradStore,
    vars: &[(String, Var)],
) -> Result<()> {
    match acc {
        None => *acc = Some(fresh),
        Some(acc) => {
            for (_, var) in vars {
                let tensor = var.as_tensor();
                let summed = match (acc.get(tensor), fresh.get(tensor)) {
                    (Some(old), Some(new)) => (old + new)?,
                    (None, Some(new)) => new.clone(),
                    (_, None) => continue,
                };
                acc.insert(tensor, summed);
            }
        }
    }
    Ok(())
}

/// Scales every gradient so their global L2 norm does not exceed
/// `max_norm`, and reports the norm seen before clipping. The squared
/// sums run in F32 whatever the gradient dtype; a bf16 reduction stalls
/// once the running sum outgrows the addend's precision.
pub fn clip_grad_norm(
    vars: &[(String, Var)],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64> {
    let mut total_sq = 0f64;
    for (_, var) in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            total_sq += sq;
        }
    }
    let norm = total_sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for (_, var) in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => grad.affine(scale, 0.0)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use crate::config::ModelConfig;
    use crate::model::Gpt;

    fn grads_norm(vars: &[(String, Var)], grads: &GradStore) -> f64 {
        let mut total = 0f64;
        for (_, var) in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq: f64 = grad
                    .sqr()
                    .unwrap()
                    .sum_all()
                    .unwrap()
                    .to_dtype(DType::F64)
                    .unwrap()
                    .to_scalar()
                    .unwrap();
                total += sq;
            }
        }
        total.sqrt()
    }

    #[test]
    fn test_partition_splits_by_rank() -> Result<()> {
        let config = ModelConfig {
            block_size: 8,
            vocab_size: 16,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            ..ModelConfig::nano()
        };
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let _model = Gpt::new(&config, vb)?;

        let groups = ParamGroups::partition(&var_map);
        assert!(!groups.decay.is_empty());
        assert!(!groups.no_decay.is_empty());
        for var in &groups.decay {
            assert!(var.rank() >= 2);
        }
        for var in &groups.no_decay {
            assert!(var.rank() < 2);
        }
        let total = groups.decay.len() + groups.no_decay.len();
        assert_eq!(total, var_map.all_vars().len());
        assert_eq!(
            groups.decay_elem_count() + groups.no_decay_elem_count(),
            config.num_parameters()
        );
        Ok(())
    }

    #[test]
    fn test_sorted_names_are_stable() -> Result<()> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        for name in ["zeta", "alpha", "mid"] {
            vb.get_with_hints(4, name, candle_nn::Init::Const(0.0))?;
        }
        let names: Vec<String> = named_vars_sorted(&var_map)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        Ok(())
    }

    #[test]
    fn test_clip_scales_large_gradients() -> Result<()> {
        let var = Var::new(&[3f32, 4.0], &Device::Cpu)?;
        let loss = (var.as_tensor() * 3.0)?.sum_all()?;
        let mut grads = loss.backward()?;
        let vars = vec![("v".to_string(), var)];

        // grad is [3, 3], so the norm is sqrt(18).
        let reported = clip_grad_norm(&vars, &mut grads, 1.0)?;
        assert!((reported - 18f64.sqrt()).abs() < 1e-5);
        let after = grads_norm(&vars, &grads);
        assert!((after - 1.0).abs() < 1e-4, "clipped norm {after}");
        Ok(())
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() -> Result<()> {
        let var = Var::new(&[1f32, 0.0], &Device::Cpu)?;
        let loss = (var.as_tensor() * 0.1)?.sum_all()?;
        let mut grads = loss.backward()?;
        let vars = vec![("v".to_string(), var.clone())];

        let reported = clip_grad_norm(&vars, &mut grads, 10.0)?;
        let after = grads_norm(&vars, &grads);
        assert!((reported - after).abs() < 1e-8);
        let grad = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>()?;
        assert!((grad[0] - 0.1).abs() < 1e-6);
        assert!((grad[1] - 0.1).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_clip_norm_is_accurate_for_bf16_gradients() -> Result<()> {
        let ones = Tensor::ones(4096, DType::BF16, &Device::Cpu)?;
        let var = Var::from_tensor(&ones)?;
        let loss = var.as_tensor().sum_all()?;
        let mut grads = loss.backward()?;
        let vars = vec![("v".to_string(), var)];

        // 4096 unit gradients: the true norm is 64. Summed in bf16 the
        // squares saturate at 256 and the norm would come out as 16.
        let reported = clip_grad_norm(&vars, &mut grads, 1e9)?;
        assert!((reported - 64.0).abs() < 1e-3, "norm {reported}");
        Ok(())
    }

    #[test]
    fn test_accumulate_sums_micro_batches() -> Result<()> {
        let var = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let vars = vec![("v".to_string(), var.clone())];

        let mut acc = None;
        for _ in 0..3 {
            let loss = (var.as_tensor() * 2.0)?.sum_all()?;
            let fresh = loss.backward()?;
            accumulate_grads(&mut acc, fresh, &vars)?;
        }
        let acc = acc.unwrap();
        let grad = acc.get(var.as_tensor()).unwrap().to_vec1::<f32>()?;
        // Each pass contributes 2 per element.
        assert!((grad[0] - 6.0).abs() < 1e-6);
        assert!((grad[1] - 6.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_grouped_adamw_applies_decay_only_to_matrices() -> Result<()> {
        let matrix = Var::new(&[[1f32, 1.0], [1.0, 1.0]], &Device::Cpu)?;
        let bias = Var::new(&[1f32, 1.0], &Device::Cpu)?;
        let var_map = VarMap::new();
        {
            let mut data = var_map.data().lock().unwrap();
            data.insert("w".to_string(), matrix.clone());
            data.insert("b".to_string(), bias.clone());
        }
        let groups = ParamGroups::partition(&var_map);
        let params = ParamsAdamW {
            lr: 0.0,
            weight_decay: 0.5,
            ..Default::default()
        };
        let mut optimizer = GroupedAdamW::new(groups, params)?;

        // AdamW skips parameters with no recorded gradient, so hand it
        // explicit zeros; the only movement left is the decoupled decay
        // term, and only for the matrix group.
        optimizer.set_learning_rate(0.1);
        let loss = (matrix.as_tensor().sum_all()? + bias.as_tensor().sum_all()?)?;
        let mut grads = loss.backward()?;
        grads.insert(matrix.as_tensor(), matrix.as_tensor().zeros_like()?);
        grads.insert(bias.as_tensor(), bias.as_tensor().zeros_like()?);
        optimizer.step(&grads)?;

        let w = matrix.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let b = bias.as_tensor().to_vec1::<f32>()?;
        for value in &w {
            // One step of theta * (1 - lr * weight_decay).
            assert!((*value - 0.95).abs() < 1e-6, "decay group at {value}");
        }
        for value in &b {
            assert!((*value - 1.0).abs() < 1e-6, "no-decay group moved to {value}");
        }
        Ok(())
    }
}
