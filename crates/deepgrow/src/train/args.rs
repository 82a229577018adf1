//! Run Arguments - CLI configuration for executing a growth plan

use std::path::PathBuf;

use clap::Args;
use stack_engine::StackPolicy;

use crate::resources::ResourceDescriptor;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Growth plan (JSON)
    #[arg(long, required = true)]
    pub plan: PathBuf,

    /// `cpu` or comma separated device ids, e.g. `0,1,2,3`
    #[arg(long, default_value = "cpu")]
    pub devices: ResourceDescriptor,

    /// Rehearse the plan with a simulated engine
    #[arg(long, action)]
    pub simulate: bool,

    /// Placement of duplicated layers when growing
    #[arg(long, default_value_t = StackPolicy::Top)]
    pub policy: StackPolicy,

    #[arg(long, default_value_t = 1000)]
    pub sim_steps_per_epoch: u64,
}
