//! Shared plan builders and a recording invoker for integration tests.

#![allow(dead_code)]

use std::path::Path;

use deepgrow::config::{GrowthPlan, PlanFile, TaskConfig};
use deepgrow::train::{SimulatedInvoker, SimulatedModel, StageLog};
use deepgrow::{ResourceDescriptor, StageSpec, TrainingFailure, TrainingInvoker};
use stack_engine::{ModelState, Role};

pub fn task() -> TaskConfig {
    TaskConfig {
        name: "toy_en_de".to_string(),
        data_dir: "data-bin/toy".into(),
        source_lang: "en".to_string(),
        target_lang: "de".to_string(),
        arch_prefix: "transformer_toy".to_string(),
    }
}

pub fn plan_file(run_dir: &Path, depths: &[usize]) -> PlanFile {
    let mut plan = PlanFile::from_depths(task(), run_dir, depths);
    plan.defaults.max_epoch = Some(1);
    plan
}

pub fn plan(run_dir: &Path, depths: &[usize]) -> GrowthPlan {
    plan_file(run_dir, depths).resolve().expect("valid plan")
}

pub fn simulated() -> SimulatedInvoker {
    SimulatedInvoker::new(SimulatedModel {
        vocab: 16,
        dim: 8,
        ffn_dim: 16,
        layer_history: true,
    })
    .with_steps_per_epoch(10)
}

/// Wraps the simulated engine, recording every call and optionally failing
/// one stage the way a crashed engine would.
pub struct RecordingInvoker {
    pub inner: SimulatedInvoker,
    /// (stage index, encoder depth of the initializer)
    pub calls: Vec<(usize, Option<usize>)>,
    pub fail_at: Option<usize>,
}

impl RecordingInvoker {
    pub fn new(fail_at: Option<usize>) -> Self {
        Self {
            inner: simulated(),
            calls: Vec::new(),
            fail_at,
        }
    }
}

impl TrainingInvoker for RecordingInvoker {
    fn run(
        &mut self,
        stage: &StageSpec,
        initial: Option<&ModelState>,
        resources: &ResourceDescriptor,
        log: &mut StageLog,
    ) -> Result<ModelState, TrainingFailure> {
        self.calls
            .push((stage.index, initial.map(|s| s.depth(Role::Encoder))));
        if self.fail_at == Some(stage.index) {
            let _ = log.line("CUDA error: out of memory");
            return Err(TrainingFailure::new("engine exited with status 1").with_exit_code(Some(1)));
        }
        self.inner.run(stage, initial, resources, log)
    }
}
