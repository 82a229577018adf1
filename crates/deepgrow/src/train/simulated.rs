//! Simulated invoker - rehearses a growth plan without a training engine
//!
//! Fresh stages get a small translation model built with `candle-nn`
//! initializers. Warm starts are nudged with seeded Gaussian noise so
//! duplicated layers drift apart the way training would make them. Each epoch
//! writes a synthetic progress line to the stage log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use stack_engine::{ModelState, Role, TensorMap};
use tracing::{debug, info};

use crate::config::StageSpec;
use crate::error::TrainingFailure;
use crate::resources::ResourceDescriptor;
use crate::train::invoker::{check_initial_depth, TrainingInvoker};
use crate::train::log::StageLog;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Shape of the simulated translation model.
#[derive(Debug, Clone)]
pub struct SimulatedModel {
    pub vocab: usize,
    pub dim: usize,
    pub ffn_dim: usize,
    /// Add dense layer-history norms: one boundary norm on the encoder, one
    /// per layer on the decoder.
    pub layer_history: bool,
}

impl Default for SimulatedModel {
    fn default() -> Self {
        Self {
            vocab: 64,
            dim: 16,
            ffn_dim: 32,
            layer_history: true,
        }
    }
}

pub struct SimulatedInvoker {
    pub model: SimulatedModel,
    pub steps_per_epoch: u64,
    pub noise_scale: f64,
    device: Device,
    interrupted: Arc<AtomicBool>,
}

impl Default for SimulatedInvoker {
    fn default() -> Self {
        Self::new(SimulatedModel::default())
    }
}

impl SimulatedInvoker {
    pub fn new(model: SimulatedModel) -> Self {
        Self {
            model,
            steps_per_epoch: 1000,
            noise_scale: 1e-3,
            device: Device::Cpu,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a flag that, once set, stops the simulation at the next epoch.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn with_steps_per_epoch(mut self, steps: u64) -> Self {
        self.steps_per_epoch = steps;
        self
    }

    fn fresh_tensors(&self, depth: usize) -> candle_core::Result<Vec<(String, Tensor)>> {
        let m = &self.model;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);

        for role in Role::ALL {
            let root = vb.pp(role.as_str());
            candle_nn::embedding(m.vocab, m.dim, root.pp("embed_tokens"))?;
            candle_nn::layer_norm(m.dim, LAYER_NORM_EPS, root.pp("layer_norm"))?;
            for i in 0..depth {
                let layer = root.pp(format!("layers.{}", i));
                attention(m.dim, layer.pp("self_attn"))?;
                candle_nn::layer_norm(m.dim, LAYER_NORM_EPS, layer.pp("self_attn_layer_norm"))?;
                if role == Role::Decoder {
                    attention(m.dim, layer.pp("encoder_attn"))?;
                    candle_nn::layer_norm(m.dim, LAYER_NORM_EPS, layer.pp("encoder_attn_layer_norm"))?;
                }
                candle_nn::linear(m.dim, m.ffn_dim, layer.pp("fc1"))?;
                candle_nn::linear(m.ffn_dim, m.dim, layer.pp("fc2"))?;
                candle_nn::layer_norm(m.dim, LAYER_NORM_EPS, layer.pp("final_layer_norm"))?;
            }
            if m.layer_history {
                let norms = match role {
                    Role::Encoder => 1,
                    Role::Decoder => depth,
                };
                for j in 0..norms {
                    candle_nn::layer_norm(
                        m.dim,
                        LAYER_NORM_EPS,
                        root.pp(format!("history.layer_norms.{}", j)),
                    )?;
                }
            }
        }
        candle_nn::linear_no_bias(m.dim, m.vocab, vb.pp("decoder.output_projection"))?;

        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }
}

fn attention(dim: usize, vb: VarBuilder) -> candle_core::Result<()> {
    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
        candle_nn::linear(dim, dim, vb.pp(proj))?;
    }
    Ok(())
}

/// Adds `scale * N(0, 1)` noise to every float tensor, drawn from one RNG
/// seeded with `seed` in key order.
fn perturb(
    mut tensors: Vec<(String, Tensor)>,
    seed: u64,
    scale: f64,
) -> candle_core::Result<Vec<(String, Tensor)>> {
    if scale == 0.0 {
        return Ok(tensors);
    }
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, 1.0).map_err(|e| candle_core::Error::Msg(e.to_string()))?;

    let mut out = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        if !tensor.dtype().is_float() {
            out.push((name, tensor));
            continue;
        }
        let noise: Vec<f32> = (0..tensor.elem_count())
            .map(|_| normal.sample(&mut rng))
            .collect();
        let noise = Tensor::from_vec(noise, tensor.shape(), tensor.device())?
            .to_dtype(tensor.dtype())?;
        let updated = (&tensor + (noise * scale)?)?;
        out.push((name, updated));
    }
    Ok(out)
}

fn sim_failure(e: candle_core::Error) -> TrainingFailure {
    TrainingFailure::new(format!("simulated training: {}", e))
}

impl TrainingInvoker for SimulatedInvoker {
    fn run(
        &mut self,
        stage: &StageSpec,
        initial: Option<&ModelState>,
        resources: &ResourceDescriptor,
        log: &mut StageLog,
    ) -> Result<ModelState, TrainingFailure> {
        check_initial_depth(stage, initial)?;
        let seed = stage.seed.wrapping_add(stage.index as u64);
        let log_err = |e: std::io::Error| TrainingFailure::new(format!("cannot write stage log: {}", e));

        let start: Vec<(String, Tensor)> = match initial {
            Some(state) => state.to_flat().into_iter().collect(),
            None => self.fresh_tensors(stage.depth).map_err(sim_failure)?,
        };
        log.line(format!(
            "simulated engine: {} ({} layers, {} tensors, warm start: {}, devices: {})",
            stage.architecture,
            stage.depth,
            start.len(),
            initial.is_some(),
            resources
        ))
        .map_err(log_err)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut step = 0u64;
        let mut loss = 0.0;
        for epoch in 1..=stage.max_epoch {
            if self.interrupted.load(Ordering::SeqCst) {
                let _ = log.line("interrupted by operator");
                return Err(TrainingFailure::interrupted());
            }
            step += self.steps_per_epoch;
            let progress = epoch as f64 / stage.max_epoch as f64;
            loss = 2.5 - 1.5 * progress + rng.gen::<f64>() * 0.1;
            log.line(format!(
                "| epoch {:03} | loss {:.3} | lr {:.3e} | num_updates {}",
                epoch,
                loss,
                stage.lr.rate_at(step),
                step
            ))
            .map_err(log_err)?;
            debug!("[{}] epoch {} loss {:.3}", stage.name, epoch, loss);
        }

        let trained = perturb(start, seed, self.noise_scale).map_err(sim_failure)?;
        let optimizer_state = trained
            .iter()
            .map(|(name, t)| -> candle_core::Result<(String, Tensor)> {
                Ok((format!("exp_avg.{}", name), t.zeros_like()?))
            })
            .collect::<candle_core::Result<TensorMap>>()
            .map_err(sim_failure)?;

        let metadata = stage.metadata().with_progress(stage.max_epoch, step);
        let mut state = ModelState::from_flat(trained, metadata)?;
        state.optimizer_state = Some(optimizer_state);

        info!(
            "🧪 [{}] simulated {} epochs ({} updates), final loss {:.3}",
            stage.name, stage.max_epoch, step, loss
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlanFile, TaskConfig};
    use stack_engine::stack_layers;
    use std::path::PathBuf;

    fn plan(dir: &std::path::Path, depths: &[usize]) -> crate::config::GrowthPlan {
        let task = TaskConfig {
            name: "toy".into(),
            data_dir: PathBuf::from("data"),
            source_lang: "en".into(),
            target_lang: "de".into(),
            arch_prefix: "transformer_toy".into(),
        };
        let mut plan = PlanFile::from_depths(task, dir, depths);
        plan.defaults.max_epoch = Some(2);
        plan.resolve().unwrap()
    }

    #[test]
    fn test_interrupt_stops_before_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), &[3]);
        let stage = &plan.stages[0];
        let mut log = StageLog::open(&stage.output_dir).unwrap();

        let mut invoker = SimulatedInvoker::default();
        invoker.interrupt_flag().store(true, Ordering::SeqCst);
        let err = invoker
            .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
            .unwrap_err();
        assert_eq!(err.message, "interrupted by operator");
        // header and the interrupt line, no epochs
        assert_eq!(log.lines_written(), 2);
    }

    #[test]
    fn test_fresh_stage_builds_full_model() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), &[3]);
        let stage = &plan.stages[0];
        let mut log = StageLog::open(&stage.output_dir).unwrap();

        let state = SimulatedInvoker::default()
            .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
            .unwrap();
        assert_eq!(state.depth(Role::Encoder), 3);
        assert_eq!(state.depth(Role::Decoder), 3);
        assert_eq!(state.history_of(Role::Encoder).count(), 1);
        assert_eq!(state.history_of(Role::Decoder).count(), 3);
        assert!(state.shared_params.contains_key("decoder.output_projection.weight"));
        assert_eq!(state.metadata.architecture, "transformer_toy_3l");
        assert_eq!((state.metadata.epoch, state.metadata.step), (2, 2000));
        assert!(state.optimizer_state.is_some());
        // header plus one line per epoch
        assert_eq!(log.lines_written(), 3);
    }

    #[test]
    fn test_warm_start_is_deterministic_and_moves_weights() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), &[2, 4]);
        let mut invoker = SimulatedInvoker::default();
        let resources = ResourceDescriptor::cpu();

        let mut log = StageLog::open(&plan.stages[0].output_dir).unwrap();
        let first = invoker.run(&plan.stages[0], None, &resources, &mut log).unwrap();
        let init = stack_layers(&first, 2).unwrap();

        let mut log = StageLog::open(&plan.stages[1].output_dir).unwrap();
        let a = invoker.run(&plan.stages[1], Some(&init), &resources, &mut log).unwrap();
        let b = invoker.run(&plan.stages[1], Some(&init), &resources, &mut log).unwrap();

        let before = init.layer(Role::Encoder, 3).unwrap();
        let after_a = a.layer(Role::Encoder, 3).unwrap();
        let after_b = b.layer(Role::Encoder, 3).unwrap();
        assert!(after_a.same_params(after_b).unwrap());
        assert!(!after_a.same_params(before).unwrap());
        // duplicates drift apart from their source layer
        assert!(!a.layer(Role::Encoder, 1).unwrap().same_params(after_a).unwrap());
    }

    #[test]
    fn test_rejects_initializer_of_wrong_depth() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), &[2, 4]);
        let mut invoker = SimulatedInvoker::default();
        let resources = ResourceDescriptor::cpu();
        let mut log = StageLog::open(&plan.stages[0].output_dir).unwrap();
        let first = invoker.run(&plan.stages[0], None, &resources, &mut log).unwrap();

        let err = invoker
            .run(&plan.stages[1], Some(&first), &resources, &mut log)
            .unwrap_err();
        assert!(err.message.contains("initializer has 2"), "{}", err.message);
    }
}
