//! The training orchestrator: a step loop alternating validation and
//! macro-steps built from accumulated micro-batches.
//!
//! Every rank runs the same loop in lockstep. The only cross-rank
//! traffic is three all-reduce means per macro-step at most: the
//! validation scalar, the reporting loss, and the gradient exchange on
//! the last micro-batch. Checkpoints, `config.json` and `main.log` are
//! written by the master rank alone.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, ensure};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::RunConfig;
use crate::data::TokenLoader;
use crate::distributed::DistributedContext;
use crate::model::Gpt;
use crate::optim::{self, GroupedAdamW, ParamGroups};

/// Warmup then cosine decay. Starts at `max_lr * floor_frac`, climbs
/// linearly to `max_lr` over `warmup_iters`, decays back to the floor by
/// `max_steps` and stays there.
pub fn lr_for_step(
    step: usize,
    max_lr: f64,
    floor_frac: f64,
    warmup_iters: usize,
    max_steps: usize,
) -> f64 {
    let min_lr = max_lr * floor_frac;
    if step < warmup_iters {
        return min_lr + (max_lr - min_lr) * step as f64 / warmup_iters as f64;
    }
    if step > max_steps {
        return min_lr;
    }
    let decay_span = (max_steps - warmup_iters).max(1);
    let decay_ratio = (step - warmup_iters) as f64 / decay_span as f64;
    let coeff = 0.5 * (1.0 + (std::f64::consts::PI * decay_ratio).cos());
    min_lr + coeff * (max_lr - min_lr)
}

/// Gradients cross the wire once per macro-step, on the last micro-batch.
pub fn should_sync_gradients(micro_step: usize, grad_accum_steps: usize) -> bool {
    micro_step + 1 == grad_accum_steps
}

pub struct Trainer {
    model: Gpt,
    optimizer: GroupedAdamW,
    var_map: VarMap,
    named_vars: Vec<(String, Var)>,
    config: RunConfig,
    grad_accum_steps: usize,
    ctx: DistributedContext,
    device: Device,
    log_file: Option<File>,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: RunConfig, ctx: DistributedContext, device: Device) -> Result<Self> {
        config.model.validate()?;
        config.training.validate()?;
        let grad_accum_steps = config.training.grad_accum_steps(ctx.world_size())?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, config.training.compute_dtype(), &device);
        let model = Gpt::new(&config.model, vb)?;
        let named_vars = optim::named_vars_sorted(&var_map);
        let groups = ParamGroups::partition(&var_map);

        if ctx.is_master() {
            info!(
                "initialized a {} parameter model ({} weight tensors)",
                config.model.num_parameters(),
                named_vars.len()
            );
            info!(
                "weight decay covers {} tensors ({} parameters), skips {} tensors ({} parameters)",
                groups.decay.len(),
                groups.decay_elem_count(),
                groups.no_decay.len(),
                groups.no_decay_elem_count()
            );
            info!(
                "total batch of {} tokens => {} accumulation steps of {} x {} per rank",
                config.training.total_batch_size,
                grad_accum_steps,
                config.training.batch_size,
                config.training.sequence_length
            );
        }

        let optimizer = GroupedAdamW::new(groups, config.training.adamw_params())?;

        let log_file = if ctx.is_master() {
            let out_dir = Path::new(&config.training.output_dir);
            std::fs::create_dir_all(out_dir)
                .with_context(|| format!("creating {}", out_dir.display()))?;
            config.save_json(&out_dir.join("config.json"))?;
            // Wiped at startup, appended to for the rest of the run.
            let file = File::create(out_dir.join("main.log"))
                .with_context(|| format!("creating the log file in {}", out_dir.display()))?;
            Some(file)
        } else {
            None
        };

        Ok(Self {
            model,
            optimizer,
            var_map,
            named_vars,
            config,
            grad_accum_steps,
            ctx,
            device,
            log_file,
            global_step: 0,
        })
    }

    /// Runs the whole schedule: validation every `val_loss_every` steps
    /// and on the terminal step, a macro-step everywhere in between.
    pub fn run(
        &mut self,
        train_loader: &mut TokenLoader,
        val_loader: &mut TokenLoader,
    ) -> Result<()> {
        let num_iterations = self.config.training.num_iterations;
        let val_loss_every = self.config.training.val_loss_every;
        let tokens_per_step = self.config.training.total_batch_size;

        let progress = if self.ctx.is_master() {
            Some(build_progress(num_iterations)?)
        } else {
            None
        };

        for step in 0..=num_iterations {
            self.global_step = step;
            let last_step = step == num_iterations;

            if step.is_multiple_of(val_loss_every) || last_step {
                let val_loss = self.validate(val_loader)?;
                if self.ctx.is_master() {
                    info!("step {step} | val loss {val_loss:.6}");
                    self.log_line(&format!("step: {step} | val loss: {val_loss:.6}"))?;
                    self.save_checkpoint(step)?;
                }
                // Nobody races ahead while the master is writing.
                self.ctx.barrier()?;
            }
            if last_step {
                break;
            }

            let start = Instant::now();
            let (loss, grad_norm, lr) = self.train_step(step, train_loader)?;
            let dt = start.elapsed().as_secs_f64();
            let tokens_per_sec = tokens_per_step as f64 / dt;

            if self.ctx.is_master() {
                self.log_line(&format!("step: {step} | train loss: {loss:.6}"))?;
                if let Some(pb) = &progress {
                    pb.set_message(format!(
                        "loss {loss:.4} lr {lr:.2e} norm {grad_norm:.3} {tokens_per_sec:.0} tok/s"
                    ));
                    pb.inc(1);
                }
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
        Ok(())
    }

    /// Mean loss over `val_max_steps` batches, averaged across ranks.
    pub fn validate(&self, val_loader: &mut TokenLoader) -> Result<f32> {
        val_loader.reset();
        let val_max_steps = self.config.training.val_max_steps;
        let mut loss_accum = 0f32;
        for _ in 0..val_max_steps {
            let (inputs, targets) = val_loader.next_batch(&self.device)?;
            let (_, loss) = self.model.forward(&inputs, Some(&targets))?;
            let loss = loss.context("model returned no loss for a target batch")?;
            loss_accum += loss.to_dtype(DType::F32)?.to_scalar::<f32>()? / val_max_steps as f32;
        }
        self.ctx.all_reduce_mean_scalar(loss_accum)
    }

    /// One optimizer step: accumulate micro-batch gradients, exchange
    /// them once, clip, schedule the rate, apply. Returns the reporting
    /// loss, the pre-clip gradient norm and the rate used.
    fn train_step(
        &mut self,
        step: usize,
        train_loader: &mut TokenLoader,
    ) -> Result<(f32, f64, f64)> {
        let grad_accum_steps = self.grad_accum_steps;
        let grad_clip = self.config.training.grad_clip;
        let max_lr = self.config.training.learning_rate;
        let floor_frac = self.config.training.learning_rate_decay_frac;
        let warmup_iters = self.config.training.warmup_iters;
        let num_iterations = self.config.training.num_iterations;

        let mut grads: Option<GradStore> = None;
        let mut loss_accum = 0f32;
        for micro_step in 0..grad_accum_steps {
            let (inputs, targets) = train_loader.next_batch(&self.device)?;
            let (_, loss) = self.model.forward(&inputs, Some(&targets))?;
            let loss = loss.context("model returned no loss for a target batch")?;
            // Normalized here so the accumulated gradient matches one
            // large batch of total_batch_size tokens.
            let loss = (loss / grad_accum_steps as f64)?;
            loss_accum += loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            let fresh = loss.backward()?;
            optim::accumulate_grads(&mut grads, fresh, &self.named_vars)?;

            if should_sync_gradients(micro_step, grad_accum_steps)
                && let Some(acc) = grads.as_mut()
            {
                self.ctx.sync_gradients(&self.named_vars, acc)?;
            }
        }
        let mut grads = grads.context("gradient accumulation produced no gradients")?;

        let loss_mean = self.ctx.all_reduce_mean_scalar(loss_accum)?;
        let grad_norm = optim::clip_grad_norm(&self.named_vars, &mut grads, grad_clip)?;
        let lr = lr_for_step(step, max_lr, floor_frac, warmup_iters, num_iterations);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        Ok((loss_mean, grad_norm, lr))
    }

    fn save_checkpoint(&self, step: usize) -> Result<()> {
        let path = Path::new(&self.config.training.output_dir)
            .join(format!("step_{step:06}.safetensors"));
        self.var_map.save(&path)?;
        info!("saved checkpoint {}", path.display());
        Ok(())
    }

    /// Overwrites the model parameters with a previously saved
    /// checkpoint, e.g. an imported GPT-2 one, casting to the training
    /// dtype as needed.
    pub fn load_weights(&self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        ensure!(
            tensors.len() == self.named_vars.len(),
            "checkpoint holds {} tensors, the model wants {}",
            tensors.len(),
            self.named_vars.len()
        );
        for (name, var) in &self.named_vars {
            let tensor = tensors
                .get(name)
                .with_context(|| format!("checkpoint is missing {name}"))?;
            ensure!(
                tensor.dims() == var.dims(),
                "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                tensor.dims(),
                var.dims()
            );
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }
        info!("loaded weights from {}", path.display());
        Ok(())
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        if let Some(file) = &mut self.log_file {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn model(&self) -> &Gpt {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Final barrier, then releases the communicator.
    pub fn shutdown(self) -> Result<()> {
        self.ctx.shutdown()
    }
}

fn build_progress(num_iterations: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(num_iterations as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );
    Ok(pb)
}
