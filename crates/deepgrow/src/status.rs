//! `deepgrow status` - completion of every stage in a plan

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use stack_engine::{CheckpointStore, StackError};

use crate::config::GrowthPlan;
use crate::train::orchestrator::resume_point;

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Growth plan (JSON)
    #[arg(long, required = true)]
    pub plan: PathBuf,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let plan = GrowthPlan::load(&args.plan)
        .with_context(|| format!("loading plan {}", args.plan.display()))?;
    let store = CheckpointStore::new();

    println!(
        "📋 {} ({} -> {}), run dir {}",
        plan.task.name,
        plan.task.source_lang,
        plan.task.target_lang,
        plan.run_dir.display()
    );
    for stage in &plan.stages {
        let state = match store.read_manifest(&stage.output_dir) {
            Ok(m) => format!(
                "✅ completed  epoch {:>3}  step {:>7}  {}",
                m.metadata.epoch,
                m.metadata.step,
                m.saved_at.format("%Y-%m-%d %H:%M")
            ),
            Err(StackError::NotFound(_)) => "⏳ pending".to_string(),
            Err(e) => format!("⚠️ unreadable: {}", e),
        };
        println!(
            "  {:>2}. {:<16} {:>3} layers (+{:<2}) lr {:.1e}/{}w  {}",
            stage.index + 1,
            stage.name,
            stage.depth,
            stage.growth_increment,
            stage.lr.peak_lr,
            stage.lr.warmup_steps,
            state
        );
    }

    match resume_point(&store, &plan.stages) {
        Ok(next) if next == plan.stages.len() => println!("🎉 All stages completed."),
        Ok(next) => println!(
            "▶️ Next: stage {} ({})",
            next + 1,
            plan.stages[next].name
        ),
        Err(e) => println!("❌ {}", e),
    }
    Ok(())
}
