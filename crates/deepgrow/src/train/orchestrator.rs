//! Stage orchestrator - runs a growth plan stage by stage
//!
//! Each stage warm-starts from the previous stage's checkpoint grown to the
//! new depth, trains through a [`TrainingInvoker`], and persists its result.
//! Stages already holding a completed checkpoint are skipped, so rerunning a
//! plan resumes after the last finished stage.

use std::fmt;

use stack_engine::{
    CheckpointStore, LayerStackTransform, ModelState, Role, StackError, StackPolicy,
};
use tracing::{error, info};

use crate::config::{StageSequence, StageSpec};
use crate::error::{
    InvalidTransition, OrchestratorError, StageError, StageFailure, TrainingFailure,
};
use crate::resources::ResourceDescriptor;
use crate::train::invoker::TrainingInvoker;
use crate::train::log::StageLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Initializing,
    Training,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Initializing)
                | (Initializing, Training)
                | (Training, Completed)
                | (Initializing, Failed)
                | (Training, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: StageStatus) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Initializing => "initializing",
            StageStatus::Training => "training",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a stage was handled in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// A completed checkpoint was already present.
    Skipped,
    Executed,
    /// The run stopped before reaching the stage.
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub depth: usize,
    pub status: StageStatus,
    pub outcome: StageOutcome,
}

/// Per-stage summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub records: Vec<StageRecord>,
}

impl RunReport {
    pub fn executed(&self) -> usize {
        self.count(StageOutcome::Executed)
    }

    pub fn skipped(&self) -> usize {
        self.count(StageOutcome::Skipped)
    }

    pub fn failed(&self) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.status == StageStatus::Failed)
    }

    fn count(&self, outcome: StageOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }
}

pub struct StageOrchestrator<I> {
    invoker: I,
    resources: ResourceDescriptor,
    store: CheckpointStore,
    transform: LayerStackTransform,
    last_report: RunReport,
}

impl<I: TrainingInvoker> StageOrchestrator<I> {
    pub fn new(invoker: I, resources: ResourceDescriptor) -> Self {
        Self {
            invoker,
            resources,
            store: CheckpointStore::new(),
            transform: LayerStackTransform::default(),
            last_report: RunReport::default(),
        }
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_policy(mut self, policy: StackPolicy) -> Self {
        self.transform = LayerStackTransform::new(policy);
        self
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// See [`resume_point`].
    pub fn resume_point(&self, stages: &StageSequence) -> Result<usize, OrchestratorError> {
        resume_point(&self.store, stages)
    }

    /// Runs every stage not yet completed, in order. Halts on the first
    /// failure; no stage is retried. The per-stage report is also kept for
    /// [`last_report`](Self::last_report), including after a failure.
    pub fn run(&mut self, stages: &StageSequence) -> Result<RunReport, OrchestratorError> {
        self.last_report = RunReport::default();
        let start = self.resume_point(stages)?;

        for stage in &stages.stages()[..start] {
            self.check_completed(stage).map_err(|source| StageError {
                index: stage.index,
                name: stage.name.clone(),
                source,
            })?;
            info!("⏭️ Stage {} ({}) already completed, skipping", stage.index + 1, stage.name);
            self.last_report
                .records
                .push(record(stage, StageStatus::Completed, StageOutcome::Skipped));
        }
        if start == stages.len() {
            info!("✅ All {} stages already completed", stages.len());
            return Ok(self.last_report.clone());
        }

        for stage in &stages.stages()[start..] {
            let mut status = StageStatus::Pending;
            info!(
                "🌱 Stage {}/{} ({}): {} layers, growth +{}",
                stage.index + 1,
                stages.len(),
                stage.name,
                stage.depth,
                stage.growth_increment
            );
            let result = self.run_stage(stages, stage, &mut status);
            if result.is_err() && status.can_transition_to(StageStatus::Failed) {
                status = StageStatus::Failed;
            }
            self.last_report
                .records
                .push(record(stage, status, StageOutcome::Executed));
            if let Err(source) = result {
                error!("❌ Stage {} ({}) failed: {}", stage.index + 1, stage.name, source);
                for rest in &stages.stages()[stage.index + 1..] {
                    self.last_report
                        .records
                        .push(record(rest, StageStatus::Pending, StageOutcome::NotReached));
                }
                return Err(StageError {
                    index: stage.index,
                    name: stage.name.clone(),
                    source,
                }
                .into());
            }
            info!("✅ Stage {} ({}) completed", stage.index + 1, stage.name);
        }
        Ok(self.last_report.clone())
    }

    /// Report of the most recent [`run`](Self::run).
    pub fn last_report(&self) -> &RunReport {
        &self.last_report
    }

    fn run_stage(
        &mut self,
        stages: &StageSequence,
        stage: &StageSpec,
        status: &mut StageStatus,
    ) -> Result<(), StageFailure> {
        status.advance(StageStatus::Initializing)?;
        let mut log = StageLog::open(&stage.output_dir)?;
        log.line(format!(
            "stage {} ({}): {} layers per role, growth +{}, {} tokens per update on {}",
            stage.index + 1,
            stage.name,
            stage.depth,
            stage.growth_increment,
            stage.batch.tokens_per_update(self.resources.worker_count()),
            self.resources
        ))?;

        let initial = match self.initialize(stages, stage, &mut log) {
            Ok(initial) => initial,
            Err(e) => {
                status.advance(StageStatus::Failed)?;
                let _ = log.line(format!("initialization failed: {}", e));
                return Err(e);
            }
        };

        status.advance(StageStatus::Training)?;
        let trained = self
            .invoker
            .run(stage, initial.as_ref(), &self.resources, &mut log)
            .and_then(|state| {
                check_depth(&state, stage.depth)?;
                Ok(state)
            });
        let trained = match trained {
            Ok(state) => state,
            Err(e) => {
                status.advance(StageStatus::Failed)?;
                let _ = log.line(format!("training failed: {}", e.message));
                return Err(e.into());
            }
        };

        let manifest = match self.store.save(&trained, &stage.output_dir) {
            Ok(m) => m,
            Err(e) => {
                status.advance(StageStatus::Failed)?;
                let _ = log.line(format!("saving checkpoint failed: {}", e));
                return Err(e.into());
            }
        };
        let _ = log.line(format!(
            "checkpoint saved: {} tensors, epoch {}, step {}",
            manifest.tensor_count, manifest.metadata.epoch, manifest.metadata.step
        ));
        status.advance(StageStatus::Completed)?;
        Ok(())
    }

    /// Warm-start state for `stage`: `None` for the first stage, otherwise
    /// the previous stage's checkpoint grown by the stage's increment.
    fn initialize(
        &self,
        stages: &StageSequence,
        stage: &StageSpec,
        log: &mut StageLog,
    ) -> Result<Option<ModelState>, StageFailure> {
        if stage.index == 0 {
            log.line("fresh start")?;
            return Ok(None);
        }
        let previous = &stages[stage.index - 1];
        let source = self.store.load(&previous.output_dir)?;
        check_depth(&source, previous.depth).map_err(|e| {
            StackError::invalid_depth(format!(
                "checkpoint of stage {} ({}): {}",
                previous.index + 1,
                previous.name,
                e.message
            ))
        })?;
        let grown = self
            .transform
            .apply(&source, stage.growth_increment as i64)?;
        log.line(format!(
            "warm start from {}: {} -> {} layers ({} policy)",
            previous.output_dir.display(),
            previous.depth,
            stage.depth,
            self.transform.policy
        ))?;
        Ok(Some(grown))
    }

    fn check_completed(&self, stage: &StageSpec) -> Result<(), StageFailure> {
        let manifest = self.store.read_manifest(&stage.output_dir)?;
        for role in Role::ALL {
            let depth = manifest.metadata.depth(role);
            if depth != stage.depth {
                return Err(StackError::invalid_depth(format!(
                    "completed checkpoint in {} has {} {} layers, plan expects {}",
                    stage.output_dir.display(),
                    depth,
                    role,
                    stage.depth
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Index of the first stage without a completed checkpoint
/// (`stages.len()` when every stage is done).
///
/// Fails if a completed stage follows an incomplete one.
pub fn resume_point(
    store: &CheckpointStore,
    stages: &StageSequence,
) -> Result<usize, OrchestratorError> {
    let done: Vec<bool> = stages
        .iter()
        .map(|s| store.is_completed(&s.output_dir))
        .collect();
    let start = done.iter().position(|d| !d).unwrap_or(done.len());
    if let Some(later) = (start..done.len()).find(|&i| done[i]) {
        return Err(OrchestratorError::InconsistentRun {
            completed_index: later,
            completed: stages[later].name.clone(),
            missing_index: start,
            missing: stages[start].name.clone(),
        });
    }
    Ok(start)
}

fn check_depth(state: &ModelState, depth: usize) -> Result<(), TrainingFailure> {
    for role in Role::ALL {
        if state.depth(role) != depth {
            return Err(TrainingFailure::new(format!(
                "state has {} {} layers, expected {}",
                state.depth(role),
                role,
                depth
            )));
        }
    }
    Ok(())
}

fn record(stage: &StageSpec, status: StageStatus, outcome: StageOutcome) -> StageRecord {
    StageRecord {
        index: stage.index,
        name: stage.name.clone(),
        depth: stage.depth,
        status,
        outcome,
    }
}
