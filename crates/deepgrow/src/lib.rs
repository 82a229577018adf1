//! deepgrow - staged depth growth for encoder-decoder translation models
//!
//! Train a shallow model, grow it by duplicating trained layers, keep
//! training, and repeat until the target depth. Checkpoint manipulation lives
//! in `stack_engine`; this crate drives the stages.

pub mod cli;
pub mod config;
pub mod error;
pub mod init;
pub mod presets;
pub mod resources;
pub mod stack;
pub mod status;
pub mod train;

pub use config::{GrowthPlan, PlanFile, StageSequence, StageSpec};
pub use error::{ConfigError, OrchestratorError, StageError, StageFailure, TrainingFailure};
pub use resources::ResourceDescriptor;
pub use train::{StageOrchestrator, TrainingInvoker};
