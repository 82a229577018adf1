use crate::init::InitArgs;
use crate::stack::StackArgs;
use crate::status::StatusArgs;
use crate::train::RunArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Progressive depth growth for translation models", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Grow a checkpoint by duplicating trained layers
    Stack(StackArgs),

    /// Run a growth plan stage by stage (resumes completed stages)
    Run(RunArgs),

    /// Show completion of every stage in a plan
    Status(StatusArgs),

    /// Write a plan skeleton from a preset or depth list
    Init(InitArgs),
}
