//! Train Module - staged progressive-growth training
//!
//! - args: CLI arguments for `deepgrow run`
//! - invoker: the TrainingInvoker seam
//! - process / simulated: engine invokers
//! - orchestrator: stage state machine and resume logic
//! - log: per-stage `train.log`

pub mod args;
pub mod invoker;
pub mod launch;
pub mod log;
pub mod orchestrator;
pub mod process;
pub mod simulated;

pub use args::RunArgs;
pub use invoker::TrainingInvoker;
pub use launch::run;
pub use log::StageLog;
pub use orchestrator::{RunReport, StageOrchestrator, StageOutcome, StageRecord, StageStatus};
pub use process::ProcessInvoker;
pub use simulated::{SimulatedInvoker, SimulatedModel};
