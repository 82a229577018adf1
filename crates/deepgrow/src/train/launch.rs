//! `deepgrow run` - load a plan and drive the orchestrator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::GrowthPlan;
use crate::train::args::RunArgs;
use crate::train::invoker::TrainingInvoker;
use crate::train::orchestrator::{RunReport, StageOrchestrator, StageOutcome, StageStatus};
use crate::train::process::ProcessInvoker;
use crate::train::simulated::SimulatedInvoker;

pub fn run(args: RunArgs) -> Result<()> {
    let plan = GrowthPlan::load(&args.plan)
        .with_context(|| format!("loading plan {}", args.plan.display()))?;
    info!(
        "--- deepgrow: {} ({} -> {}) ---",
        plan.task.name, plan.task.source_lang, plan.task.target_lang
    );
    info!(
        "Plan: {} stages, depths {:?}, devices {}, policy {}{}",
        plan.stages.len(),
        plan.stages.depths(),
        args.devices,
        args.policy,
        if args.simulate { " (simulated)" } else { "" }
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let report = if args.simulate {
        let invoker = SimulatedInvoker::default()
            .with_steps_per_epoch(args.sim_steps_per_epoch)
            .with_interrupt_flag(interrupted);
        execute(invoker, &plan, &args)?
    } else {
        let invoker = ProcessInvoker::new(plan.engine.clone(), plan.task.clone())
            .with_interrupt_flag(interrupted);
        execute(invoker, &plan, &args)?
    };

    info!(
        "🎉 Growth plan finished: {} stages trained, {} skipped, final depth {}",
        report.executed(),
        report.skipped(),
        plan.stages.target_depth()
    );
    Ok(())
}

fn execute<I: TrainingInvoker>(invoker: I, plan: &GrowthPlan, args: &RunArgs) -> Result<RunReport> {
    let mut orchestrator =
        StageOrchestrator::new(invoker, args.devices.clone()).with_policy(args.policy);
    let result = orchestrator.run(&plan.stages);
    print_report(orchestrator.last_report());
    Ok(result?)
}

fn print_report(report: &RunReport) {
    if report.records.is_empty() {
        return;
    }
    println!("\nStage summary:");
    for r in &report.records {
        let mark = match (r.status, r.outcome) {
            (_, StageOutcome::Skipped) => "⏭️",
            (StageStatus::Completed, _) => "✅",
            (StageStatus::Failed, _) => "❌",
            _ => "⏸️",
        };
        let outcome = match r.outcome {
            StageOutcome::Skipped => "skipped",
            StageOutcome::Executed => "executed",
            StageOutcome::NotReached => "not reached",
        };
        println!(
            "  {} {:>2}. {:<16} {:>3} layers  {:<10} {}",
            mark,
            r.index + 1,
            r.name,
            r.depth,
            r.status.to_string(),
            outcome
        );
    }
}
