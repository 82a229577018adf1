//! Growth plans - stage configuration resolved from a JSON plan file
//!
//! A plan names the translation task, the engine program and an ordered list
//! of stages. Each stage is resolved against the plan defaults into a complete
//! [`StageSpec`]; the resolved list is checked as a whole by
//! [`StageSequence::new`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stack_engine::model::retag_architecture;
use stack_engine::StateMetadata;

use crate::error::ConfigError;

pub const DEFAULT_LR: f64 = 0.002;
pub const DEFAULT_WARMUP_STEPS: u64 = 8000;
pub const DEFAULT_WARMUP_INIT_LR: f64 = 1e-7;
pub const DEFAULT_MIN_LR: f64 = 1e-9;
pub const DEFAULT_OPTIMIZER: &str = "adam";
pub const DEFAULT_ADAM_BETAS: (f64, f64) = (0.9, 0.997);
pub const DEFAULT_ADAM_EPS: f64 = 1e-8;
pub const DEFAULT_LABEL_SMOOTHING: f64 = 0.1;
pub const DEFAULT_MAX_EPOCH: u64 = 20;
pub const DEFAULT_MAX_TOKENS: usize = 4096;
pub const DEFAULT_UPDATE_FREQ: usize = 2;
pub const DEFAULT_LOG_INTERVAL: u64 = 100;
pub const DEFAULT_SEED: u64 = 1;
pub const DEFAULT_ARCH_PREFIX: &str = "transformer_t2t_wmt_en_de";
pub const DEFAULT_ENGINE: &str = "fairseq-train";

/// Shape of the learning rate curve after warmup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayShape {
    #[default]
    InverseSqrt,
    Cosine,
    Linear,
}

impl DecayShape {
    /// Scheduler name understood by the training engine.
    pub fn scheduler_name(&self) -> &'static str {
        match self {
            DecayShape::InverseSqrt => "inverse_sqrt",
            DecayShape::Cosine => "cosine",
            DecayShape::Linear => "polynomial_decay",
        }
    }

    fn needs_horizon(&self) -> bool {
        !matches!(self, DecayShape::InverseSqrt)
    }
}

/// Learning rate schedule of one stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LrSchedule {
    pub peak_lr: f64,
    pub warmup_steps: u64,
    pub warmup_init_lr: f64,
    pub min_lr: f64,
    pub decay: DecayShape,
    /// Update count the decay runs over. Required for cosine and linear.
    pub total_steps: Option<u64>,
}

impl LrSchedule {
    /// Learning rate at update `step` (0-based).
    pub fn rate_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            let frac = step as f64 / self.warmup_steps as f64;
            return self.warmup_init_lr + (self.peak_lr - self.warmup_init_lr) * frac;
        }
        let rate = match self.decay {
            DecayShape::InverseSqrt => {
                let warmup = self.warmup_steps.max(1) as f64;
                self.peak_lr * (warmup / (step.max(1) as f64)).sqrt()
            }
            DecayShape::Cosine | DecayShape::Linear => {
                let total = self.total_steps.unwrap_or(self.warmup_steps);
                let span = total.saturating_sub(self.warmup_steps).max(1) as f64;
                let progress = ((step - self.warmup_steps) as f64 / span).clamp(0.0, 1.0);
                let decay = match self.decay {
                    DecayShape::Cosine => 0.5 * (1.0 + (progress * std::f64::consts::PI).cos()),
                    _ => 1.0 - progress,
                };
                self.min_lr + (self.peak_lr - self.min_lr) * decay
            }
        };
        rate.max(self.min_lr)
    }

    fn validate(&self, stage: &str) -> Result<(), ConfigError> {
        if !self.peak_lr.is_finite() || self.peak_lr <= 0.0 {
            return Err(ConfigError::stage(stage, format!("lr must be positive, got {}", self.peak_lr)));
        }
        if self.min_lr < 0.0 || self.min_lr > self.peak_lr {
            return Err(ConfigError::stage(
                stage,
                format!("min_lr {} must lie in [0, lr={}]", self.min_lr, self.peak_lr),
            ));
        }
        if self.warmup_init_lr < 0.0 || self.warmup_init_lr > self.peak_lr {
            return Err(ConfigError::stage(
                stage,
                format!("warmup_init_lr {} must lie in [0, lr={}]", self.warmup_init_lr, self.peak_lr),
            ));
        }
        if self.decay.needs_horizon() {
            match self.total_steps {
                None => {
                    return Err(ConfigError::stage(
                        stage,
                        format!("{:?} decay needs total_steps", self.decay),
                    ))
                }
                Some(total) if total <= self.warmup_steps => {
                    return Err(ConfigError::stage(
                        stage,
                        format!("total_steps {} must exceed warmup_steps {}", total, self.warmup_steps),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizerSpec {
    pub kind: String,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    /// Gradient clipping threshold; 0 disables clipping.
    pub clip_norm: f64,
}

impl OptimizerSpec {
    fn validate(&self, stage: &str) -> Result<(), ConfigError> {
        if self.kind.trim().is_empty() {
            return Err(ConfigError::stage(stage, "optimizer name is empty"));
        }
        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(ConfigError::stage(
                stage,
                format!("adam betas ({}, {}) must lie in [0, 1)", b1, b2),
            ));
        }
        if self.eps <= 0.0 || self.weight_decay < 0.0 || self.clip_norm < 0.0 {
            return Err(ConfigError::stage(
                stage,
                "adam_eps must be positive; weight_decay and clip_norm non-negative",
            ));
        }
        Ok(())
    }
}

/// Per-update batch budget.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchBudget {
    pub max_tokens: usize,
    pub update_freq: usize,
}

impl BatchBudget {
    /// Tokens contributing to one optimizer update across `devices`.
    pub fn tokens_per_update(&self, devices: usize) -> usize {
        self.max_tokens * self.update_freq * devices.max(1)
    }
}

/// Fully resolved configuration of one training stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageSpec {
    pub index: usize,
    pub name: String,
    /// Target layer count per role.
    pub depth: usize,
    /// Layers added relative to the previous stage; 0 for the first stage.
    pub growth_increment: usize,
    pub architecture: String,
    pub lr: LrSchedule,
    pub optimizer: OptimizerSpec,
    pub label_smoothing: f64,
    pub max_epoch: u64,
    pub batch: BatchBudget,
    /// Start with fresh optimizer and scheduler state.
    pub reset_optimizer: bool,
    pub log_interval: u64,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl StageSpec {
    /// Metadata a checkpoint produced by this stage should carry.
    pub fn metadata(&self) -> StateMetadata {
        StateMetadata::new(self.architecture.clone(), self.depth, self.depth)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        if self.depth == 0 {
            return Err(ConfigError::stage(name, "depth must be at least 1"));
        }
        if let Some(tagged) = self.metadata().tagged_depth() {
            if tagged != self.depth {
                return Err(ConfigError::stage(
                    name,
                    format!(
                        "architecture '{}' names depth {} but the stage trains {} layers",
                        self.architecture, tagged, self.depth
                    ),
                ));
            }
        }
        self.lr.validate(name)?;
        self.optimizer.validate(name)?;
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(ConfigError::stage(
                name,
                format!("label_smoothing {} must lie in [0, 1)", self.label_smoothing),
            ));
        }
        if self.max_epoch == 0 {
            return Err(ConfigError::stage(name, "max_epoch must be at least 1"));
        }
        if self.batch.max_tokens == 0 || self.batch.update_freq == 0 {
            return Err(ConfigError::stage(name, "max_tokens and update_freq must be at least 1"));
        }
        if self.log_interval == 0 {
            return Err(ConfigError::stage(name, "log_interval must be at least 1"));
        }
        Ok(())
    }
}

/// Ordered, validated list of stages.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSequence {
    stages: Vec<StageSpec>,
}

impl StageSequence {
    /// Checks ordering rules: depths never decrease, each growth increment
    /// equals the depth difference to the previous stage, and output
    /// directories and names are unique.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::Empty);
        }
        let mut dirs = HashSet::new();
        let mut names = HashSet::new();
        let mut previous: Option<&StageSpec> = None;
        for (i, stage) in stages.iter().enumerate() {
            stage.validate()?;
            if stage.index != i {
                return Err(ConfigError::stage(
                    &stage.name,
                    format!("stage index {} out of order (expected {})", stage.index, i),
                ));
            }
            let expected = match previous {
                None => 0,
                Some(prev) if stage.depth < prev.depth => {
                    return Err(ConfigError::stage(
                        &stage.name,
                        format!("depth {} is below the previous stage's {}", stage.depth, prev.depth),
                    ))
                }
                Some(prev) => stage.depth - prev.depth,
            };
            if stage.growth_increment != expected {
                return Err(ConfigError::stage(
                    &stage.name,
                    format!(
                        "growth_increment {} does not match the depth step {}",
                        stage.growth_increment, expected
                    ),
                ));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::stage(&stage.name, "duplicate stage name"));
            }
            if !dirs.insert(stage.output_dir.as_path()) {
                return Err(ConfigError::stage(
                    &stage.name,
                    format!("output directory {} is used twice", stage.output_dir.display()),
                ));
            }
            previous = Some(stage);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageSpec> {
        self.stages.iter()
    }

    pub fn target_depth(&self) -> usize {
        self.stages.last().map_or(0, |s| s.depth)
    }

    /// Depth schedule, e.g. `[6, 12, 18]`.
    pub fn depths(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.depth).collect()
    }
}

impl std::ops::Index<usize> for StageSequence {
    type Output = StageSpec;

    fn index(&self, i: usize) -> &StageSpec {
        &self.stages[i]
    }
}

impl<'a> IntoIterator for &'a StageSequence {
    type Item = &'a StageSpec;
    type IntoIter = std::slice::Iter<'a, StageSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

// ---------------------------------------------------------------------------
// Plan file
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default = "default_arch_prefix")]
    pub arch_prefix: String,
}

fn default_arch_prefix() -> String {
    DEFAULT_ARCH_PREFIX.to_string()
}

/// External training engine invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_engine")]
    pub program: String,
    /// Passed verbatim before the stage arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Appended after the stage arguments; rendered as templates with
    /// `stage`, `task`, `devices` and `work_dir` in scope.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Seconds between progress lines mirrored to the console.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

fn default_progress_interval() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine(),
            args: Vec::new(),
            extra_args: Vec::new(),
            progress_interval_secs: default_progress_interval(),
        }
    }
}

/// Stage fields as written in a plan; unset fields fall back to the plan's
/// `defaults`, then to built-in values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_increment: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_init_lr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_lr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<DecayShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adam_betas: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adam_eps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_norm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_smoothing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_freq: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_optimizer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Relative paths are taken from the plan's `run_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl StageOverrides {
    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth: Some(depth),
            ..Default::default()
        }
    }
}

/// On-disk growth plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub task: TaskConfig,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub defaults: StageOverrides,
    pub stages: Vec<StageOverrides>,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl PlanFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Skeleton plan with one stage per depth.
    pub fn from_depths(task: TaskConfig, run_dir: impl Into<PathBuf>, depths: &[usize]) -> Self {
        Self {
            task,
            run_dir: run_dir.into(),
            engine: EngineConfig::default(),
            defaults: StageOverrides {
                max_epoch: Some(DEFAULT_MAX_EPOCH),
                ..Default::default()
            },
            stages: depths.iter().map(|&d| StageOverrides::with_depth(d)).collect(),
        }
    }

    /// Resolves every stage and validates the sequence.
    pub fn resolve(self) -> Result<GrowthPlan, ConfigError> {
        let mut resolved = Vec::with_capacity(self.stages.len());
        let mut previous_depth: Option<usize> = None;
        for (index, stage) in self.stages.iter().enumerate() {
            let spec = resolve_stage(&self, stage, index, previous_depth)?;
            previous_depth = Some(spec.depth);
            resolved.push(spec);
        }
        let stages = StageSequence::new(resolved)?;
        Ok(GrowthPlan {
            task: self.task,
            run_dir: self.run_dir,
            engine: self.engine,
            stages,
        })
    }
}

fn resolve_stage(
    plan: &PlanFile,
    stage: &StageOverrides,
    index: usize,
    previous_depth: Option<usize>,
) -> Result<StageSpec, ConfigError> {
    let d = &plan.defaults;
    let fallback_name = format!("stage{}", index + 1);
    let name = stage.name.clone().unwrap_or(fallback_name);
    let depth = stage
        .depth
        .ok_or_else(|| ConfigError::stage(&name, "depth is required"))?;
    let growth_increment = match stage.growth_increment {
        Some(g) => g,
        None => previous_depth.map_or(0, |p| depth.saturating_sub(p)),
    };
    let architecture = stage
        .architecture
        .clone()
        .unwrap_or_else(|| retag_architecture(&plan.task.arch_prefix, depth));
    let output_dir = match &stage.output_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => plan.run_dir.join(dir),
        None => plan.run_dir.join(format!("stage_{:02}_{}l", index + 1, depth)),
    };

    Ok(StageSpec {
        index,
        name,
        depth,
        growth_increment,
        architecture,
        lr: LrSchedule {
            peak_lr: stage.lr.or(d.lr).unwrap_or(DEFAULT_LR),
            warmup_steps: stage.warmup_steps.or(d.warmup_steps).unwrap_or(DEFAULT_WARMUP_STEPS),
            warmup_init_lr: stage
                .warmup_init_lr
                .or(d.warmup_init_lr)
                .unwrap_or(DEFAULT_WARMUP_INIT_LR),
            min_lr: stage.min_lr.or(d.min_lr).unwrap_or(DEFAULT_MIN_LR),
            decay: stage.decay.or(d.decay).unwrap_or_default(),
            total_steps: stage.total_steps.or(d.total_steps),
        },
        optimizer: OptimizerSpec {
            kind: stage
                .optimizer
                .clone()
                .or_else(|| d.optimizer.clone())
                .unwrap_or_else(|| DEFAULT_OPTIMIZER.to_string()),
            betas: stage.adam_betas.or(d.adam_betas).unwrap_or(DEFAULT_ADAM_BETAS),
            eps: stage.adam_eps.or(d.adam_eps).unwrap_or(DEFAULT_ADAM_EPS),
            weight_decay: stage.weight_decay.or(d.weight_decay).unwrap_or(0.0),
            clip_norm: stage.clip_norm.or(d.clip_norm).unwrap_or(0.0),
        },
        label_smoothing: stage
            .label_smoothing
            .or(d.label_smoothing)
            .unwrap_or(DEFAULT_LABEL_SMOOTHING),
        max_epoch: stage.max_epoch.or(d.max_epoch).unwrap_or(DEFAULT_MAX_EPOCH),
        batch: BatchBudget {
            max_tokens: stage.max_tokens.or(d.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            update_freq: stage.update_freq.or(d.update_freq).unwrap_or(DEFAULT_UPDATE_FREQ),
        },
        reset_optimizer: stage
            .reset_optimizer
            .or(d.reset_optimizer)
            .unwrap_or(index > 0),
        log_interval: stage.log_interval.or(d.log_interval).unwrap_or(DEFAULT_LOG_INTERVAL),
        seed: stage.seed.or(d.seed).unwrap_or(DEFAULT_SEED),
        output_dir,
    })
}

/// A resolved plan: task, engine and the validated stage sequence.
#[derive(Clone, Debug)]
pub struct GrowthPlan {
    pub task: TaskConfig,
    pub run_dir: PathBuf,
    pub engine: EngineConfig,
    pub stages: StageSequence,
}

impl GrowthPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        PlanFile::load(path)?.resolve()
    }
}
