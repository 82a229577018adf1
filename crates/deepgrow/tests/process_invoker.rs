//! Drives `ProcessInvoker` against a shell script standing in for the engine.
#![cfg(unix)]

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use common::{plan_file, simulated};
use deepgrow::config::GrowthPlan;
use deepgrow::train::log::STAGE_LOG_FILE;
use deepgrow::train::process::{ENGINE_CHECKPOINT, ENGINE_DIR, ENGINE_OPTIMIZER, INIT_FILE};
use deepgrow::train::{ProcessInvoker, StageLog};
use deepgrow::{ResourceDescriptor, TrainingInvoker};
use stack_engine::{stack_layers, CheckpointStore, Role};

/// Plan whose engine is `sh -c <script>`; stage arguments land in `$@`.
fn fake_engine_plan(run_dir: &Path, depths: &[usize], script: &str) -> GrowthPlan {
    let mut plan = plan_file(run_dir, depths);
    plan.engine.program = "sh".to_string();
    plan.engine.args = vec!["-c".to_string(), script.to_string(), "fake-engine".to_string()];
    plan.engine.progress_interval_secs = 0;
    plan.resolve().expect("valid plan")
}

/// Writes a trained checkpoint of `depth` layers where the script can copy it.
fn prepared_checkpoint(dir: &Path, plan: &GrowthPlan, stage: usize) -> std::path::PathBuf {
    let spec = &plan.stages[stage];
    let mut log = StageLog::open(dir.join("prep")).unwrap();
    let fresh = simulated()
        .run(spec, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap();
    let path = dir.join("prepared.safetensors");
    CheckpointStore::new().save_flat(&fresh, &path).unwrap();
    path
}

fn invoker(plan: &GrowthPlan) -> ProcessInvoker {
    ProcessInvoker::new(plan.engine.clone(), plan.task.clone())
}

#[test]
fn test_engine_output_is_logged_and_checkpoint_imported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let placeholder = fake_engine_plan(dir.path(), &[3], "true");
    let prepared = prepared_checkpoint(dir.path(), &placeholder, 0);
    let work = placeholder.stages[0].output_dir.join(ENGINE_DIR);

    let script = format!(
        r#"set -e
echo "args: $*"
echo "devices=[$CUDA_VISIBLE_DEVICES]"
echo "| epoch 001 | loss 3.100 | num_updates 40"
echo "some warning" >&2
cp "{src}" "{work}/{ckpt}"
cp "{optim}" "{work}/{optim_out}"
echo '{{"epoch": 2, "num_updates": 80}}' > "{work}/checkpoint_last.json"
"#,
        src = prepared.display(),
        optim = prepared.with_extension("optim.safetensors").display(),
        work = work.display(),
        ckpt = ENGINE_CHECKPOINT,
        optim_out = ENGINE_OPTIMIZER
    );
    let plan = fake_engine_plan(dir.path(), &[3], &script);
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let state = invoker(&plan).run(stage, None, &ResourceDescriptor::gpus([2, 3]), &mut log)?;
    assert_eq!(state.depth(Role::Encoder), 3);
    assert_eq!(state.metadata.architecture, "transformer_toy_3l");
    assert_eq!((state.metadata.epoch, state.metadata.step), (2, 80));
    assert!(state.optimizer_state.is_some());

    let text = fs::read_to_string(stage.output_dir.join(STAGE_LOG_FILE))?;
    assert!(text.contains("$ sh -c"));
    assert!(text.contains("devices=[2,3]"));
    assert!(text.contains("--encoder-layers 3"));
    assert!(text.contains("--distributed-world-size 2"));
    assert!(text.contains("some warning"));
    assert!(!text.contains("--restore-file"));
    // parent environment is untouched
    assert_ne!(std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref(), Some("2,3"));
    Ok(())
}

#[test]
fn test_progress_falls_back_to_output_lines() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let placeholder = fake_engine_plan(dir.path(), &[2], "true");
    let prepared = prepared_checkpoint(dir.path(), &placeholder, 0);
    let work = placeholder.stages[0].output_dir.join(ENGINE_DIR);
    let script = format!(
        "echo '| epoch 004:  10 / 10 loss=2.1, num_updates=1234'; cp '{}' '{}/{}'",
        prepared.display(),
        work.display(),
        ENGINE_CHECKPOINT
    );
    let plan = fake_engine_plan(dir.path(), &[2], &script);
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let state = invoker(&plan).run(stage, None, &ResourceDescriptor::cpu(), &mut log)?;
    assert_eq!((state.metadata.epoch, state.metadata.step), (4, 1234));
    assert!(state.optimizer_state.is_none());
    Ok(())
}

#[test]
fn test_warm_start_passes_restore_file_and_reset_flags() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let placeholder = fake_engine_plan(dir.path(), &[2, 4], "true");
    let mut log = StageLog::open(dir.path().join("prep"))?;
    let base = simulated().run(&placeholder.stages[0], None, &ResourceDescriptor::cpu(), &mut log)?;
    let initial = stack_layers(&base, 2)?;

    let stage_dir = &placeholder.stages[1].output_dir;
    let work = stage_dir.join(ENGINE_DIR);
    let script = format!(
        "echo \"args: $*\"; cp '{work}/{init}' '{work}/{ckpt}'",
        work = work.display(),
        init = INIT_FILE,
        ckpt = ENGINE_CHECKPOINT
    );
    let plan = fake_engine_plan(dir.path(), &[2, 4], &script);
    let stage = &plan.stages[1];
    let mut log = StageLog::open(&stage.output_dir)?;

    let state = invoker(&plan).run(stage, Some(&initial), &ResourceDescriptor::cpu(), &mut log)?;
    assert_eq!(state.depth(Role::Decoder), 4);
    assert!(work.join(INIT_FILE).exists());

    let text = fs::read_to_string(stage.output_dir.join(STAGE_LOG_FILE))?;
    assert!(text.contains("--restore-file"));
    assert!(text.contains("--reset-optimizer"));
    assert!(text.contains("--arch transformer_toy_4l"));
    Ok(())
}

#[test]
fn test_engine_failure_reports_exit_code_and_last_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plan = fake_engine_plan(
        dir.path(),
        &[2],
        "echo 'epoch 001'; echo 'RuntimeError: CUDA out of memory' >&2; exit 3",
    );
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let err = invoker(&plan)
        .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap_err();
    assert_eq!(err.exit_code, Some(3));
    assert!(err.message.contains("CUDA out of memory"), "{}", err.message);
    Ok(())
}

#[test]
fn test_engine_without_checkpoint_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plan = fake_engine_plan(dir.path(), &[2], "echo done");
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let err = invoker(&plan)
        .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap_err();
    assert!(err.message.contains("without writing"), "{}", err.message);
    Ok(())
}

#[test]
fn test_missing_engine_program_fails_to_launch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut plan = plan_file(dir.path(), &[2]);
    plan.engine.program = "definitely-not-an-engine-binary".to_string();
    let plan = plan.resolve()?;
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let err = invoker(&plan)
        .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap_err();
    assert!(err.message.contains("failed to start"), "{}", err.message);
    Ok(())
}

#[test]
fn test_interrupt_kills_engine() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plan = fake_engine_plan(dir.path(), &[2], "exec sleep 30");
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let mut invoker = invoker(&plan);
    invoker.interrupt_flag().store(true, Ordering::SeqCst);
    let started = std::time::Instant::now();
    let err = invoker
        .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap_err();
    assert_eq!(err.message, "interrupted by operator");
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    Ok(())
}

#[test]
fn test_interrupt_reaches_engine_with_closed_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plan = fake_engine_plan(dir.path(), &[2], "exec >/dev/null 2>&1; exec sleep 30");
    let stage = &plan.stages[0];
    let mut log = StageLog::open(&stage.output_dir)?;

    let mut invoker = invoker(&plan);
    let flag = invoker.interrupt_flag();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(500));
        flag.store(true, Ordering::SeqCst);
    });
    let started = std::time::Instant::now();
    let err = invoker
        .run(stage, None, &ResourceDescriptor::cpu(), &mut log)
        .unwrap_err();
    trigger.join().unwrap();
    assert_eq!(err.message, "interrupted by operator");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    Ok(())
}
