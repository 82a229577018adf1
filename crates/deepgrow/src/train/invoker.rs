//! Training invoker - the seam between the orchestrator and a training engine

use stack_engine::ModelState;

use crate::config::StageSpec;
use crate::error::TrainingFailure;
use crate::resources::ResourceDescriptor;
use crate::train::log::StageLog;

/// Runs one stage of training to completion.
///
/// `initial` is `None` for a fresh start, otherwise the warm-start state
/// already grown to `stage.depth`. Progress goes to `log`. The call blocks
/// until the engine finishes and returns the trained state, or a failure the
/// orchestrator treats as opaque.
pub trait TrainingInvoker {
    fn run(
        &mut self,
        stage: &StageSpec,
        initial: Option<&ModelState>,
        resources: &ResourceDescriptor,
        log: &mut StageLog,
    ) -> Result<ModelState, TrainingFailure>;
}

impl<T: TrainingInvoker + ?Sized> TrainingInvoker for Box<T> {
    fn run(
        &mut self,
        stage: &StageSpec,
        initial: Option<&ModelState>,
        resources: &ResourceDescriptor,
        log: &mut StageLog,
    ) -> Result<ModelState, TrainingFailure> {
        (**self).run(stage, initial, resources, log)
    }
}

/// Rejects an initializer whose depth differs from the stage's.
pub(crate) fn check_initial_depth(
    stage: &StageSpec,
    initial: Option<&ModelState>,
) -> Result<(), TrainingFailure> {
    if let Some(state) = initial {
        for role in stack_engine::Role::ALL {
            let depth = state.depth(role);
            if depth != stage.depth {
                return Err(TrainingFailure::new(format!(
                    "initializer has {} {} layers, stage {} trains {}",
                    depth, role, stage.name, stage.depth
                )));
            }
        }
    }
    Ok(())
}
