//! `deepgrow stack` - grow a checkpoint offline

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use stack_engine::{CheckpointStore, LayerStackTransform, Role, StackPolicy};
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct StackArgs {
    /// Checkpoint directory, or a run directory (its newest checkpoint is used)
    #[arg(long, required = true)]
    pub source: PathBuf,

    /// Output checkpoint directory
    #[arg(long, required = true)]
    pub target: PathBuf,

    /// Layers to add per role
    #[arg(long, allow_negative_numbers = true)]
    pub grow: i64,

    #[arg(long, default_value_t = StackPolicy::Top)]
    pub policy: StackPolicy,
}

pub fn run(args: StackArgs) -> Result<()> {
    let store = CheckpointStore::new();
    let source_dir = store
        .latest_path(&args.source)
        .with_context(|| format!("no checkpoint under {}", args.source.display()))?;
    let source = store.load(&source_dir)?;
    info!(
        "📦 Loaded {} ({} encoder / {} decoder layers, {} parameters)",
        source_dir.display(),
        source.depth(Role::Encoder),
        source.depth(Role::Decoder),
        source.parameter_count()
    );

    let grown = LayerStackTransform::new(args.policy).apply(&source, args.grow)?;
    store.save(&grown, &args.target)?;
    info!(
        "🌱 Stacked {} -> {} layers ({}) into {}",
        source.depth(Role::Encoder),
        grown.depth(Role::Encoder),
        grown.metadata.architecture,
        args.target.display()
    );
    Ok(())
}
