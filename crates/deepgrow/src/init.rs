//! `deepgrow init` - write a plan skeleton from a growth preset

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::info;

use crate::config::{PlanFile, TaskConfig, DEFAULT_ARCH_PREFIX};
use crate::presets::GrowthPreset;

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Growth preset, e.g. `18l` (6 -> 12 -> 18)
    #[arg(long, conflicts_with = "depths")]
    pub preset: Option<GrowthPreset>,

    /// Explicit depth schedule, e.g. `6,12,18`
    #[arg(long, value_delimiter = ',')]
    pub depths: Vec<usize>,

    /// List available presets and exit
    #[arg(long, action)]
    pub list: bool,

    #[arg(long, default_value = "plan.json")]
    pub output: PathBuf,

    #[arg(long, default_value = "translation")]
    pub task: String,

    #[arg(long, default_value = "data-bin")]
    pub data_dir: PathBuf,

    #[arg(long, default_value = "en")]
    pub source_lang: String,

    #[arg(long, default_value = "de")]
    pub target_lang: String,

    #[arg(long, default_value = DEFAULT_ARCH_PREFIX)]
    pub arch_prefix: String,

    #[arg(long, default_value = "runs")]
    pub run_dir: PathBuf,

    /// Overwrite an existing plan file
    #[arg(long, action)]
    pub force: bool,
}

/// Builds the plan described by `args` and checks that it resolves.
pub fn build_plan(args: &InitArgs) -> Result<PlanFile> {
    let depths: Vec<usize> = match args.preset {
        Some(preset) => preset.depths().to_vec(),
        None => args.depths.clone(),
    };
    if depths.is_empty() {
        bail!("pass --preset or --depths (see --list for presets)");
    }
    let task = TaskConfig {
        name: args.task.clone(),
        data_dir: args.data_dir.clone(),
        source_lang: args.source_lang.clone(),
        target_lang: args.target_lang.clone(),
        arch_prefix: args.arch_prefix.clone(),
    };
    let plan = PlanFile::from_depths(task, &args.run_dir, &depths);
    plan.clone().resolve().context("generated plan is invalid")?;
    Ok(plan)
}

pub fn run(args: InitArgs) -> Result<()> {
    if args.list {
        println!("Available growth presets:");
        for preset in GrowthPreset::ALL {
            println!("  {}", preset);
        }
        return Ok(());
    }

    let plan = build_plan(&args)?;
    if args.output.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.output.display()
        );
    }
    let json = serde_json::to_string_pretty(&plan)?;
    fs::write(&args.output, json)
        .with_context(|| format!("writing {}", args.output.display()))?;
    let depths: Vec<usize> = plan.stages.iter().filter_map(|s| s.depth).collect();
    info!(
        "📝 Wrote plan {} with depths {:?}",
        args.output.display(),
        depths
    );
    Ok(())
}
