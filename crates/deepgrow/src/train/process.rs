//! Process invoker - runs an external training engine as a child process
//!
//! The warm-start state is handed over as a flat safetensors file, stage
//! settings become engine flags, and the engine's last checkpoint is read back
//! once it exits. Engine output is drained on two reader threads and copied to
//! the stage log line by line.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use candle_core::Device;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use minijinja::{context, Environment};
use regex::Regex;
use serde::Deserialize;
use stack_engine::checkpoint::load_tensor_map;
use stack_engine::{CheckpointStore, ModelState};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StageSpec, TaskConfig};
use crate::error::TrainingFailure;
use crate::resources::ResourceDescriptor;
use crate::train::invoker::{check_initial_depth, TrainingInvoker};
use crate::train::log::StageLog;

/// Engine working directory inside a stage directory.
pub const ENGINE_DIR: &str = "engine";
pub const ENGINE_CHECKPOINT: &str = "checkpoint_last.safetensors";
pub const ENGINE_OPTIMIZER: &str = "checkpoint_last.optim.safetensors";
pub const ENGINE_PROGRESS: &str = "checkpoint_last.json";
pub const INIT_FILE: &str = "init.safetensors";

const RESET_FLAGS: [&str; 4] = [
    "--reset-optimizer",
    "--reset-lr-scheduler",
    "--reset-dataloader",
    "--reset-meters",
];
const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct EngineLine {
    stream: Stream,
    text: String,
}

/// Sidecar the engine may write next to its last checkpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EngineProgress {
    #[serde(default)]
    pub epoch: u64,
    #[serde(default, alias = "num_updates")]
    pub step: u64,
}

/// Latest epoch and update count seen in engine output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressTracker {
    pub epoch: Option<u64>,
    pub step: Option<u64>,
}

fn epoch_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bepoch\s+(\d+)").expect("static regex"))
}

fn updates_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bnum_updates[\s=:]+(\d+)").expect("static regex"))
}

impl ProgressTracker {
    /// Records progress found in `line`. Returns whether the line had any.
    pub fn observe(&mut self, line: &str) -> bool {
        let epoch = epoch_pattern()
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok());
        let step = updates_pattern()
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok());
        if epoch.is_some() {
            self.epoch = epoch;
        }
        if step.is_some() {
            self.step = step;
        }
        epoch.is_some() || step.is_some()
    }

    pub fn progress(&self) -> EngineProgress {
        EngineProgress {
            epoch: self.epoch.unwrap_or(0),
            step: self.step.unwrap_or(0),
        }
    }
}

/// Invokes the configured engine program once per stage.
pub struct ProcessInvoker {
    engine: EngineConfig,
    task: TaskConfig,
    store: CheckpointStore,
    interrupted: Arc<AtomicBool>,
}

impl ProcessInvoker {
    pub fn new(engine: EngineConfig, task: TaskConfig) -> Self {
        Self {
            engine,
            task,
            store: CheckpointStore::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a flag that, once set, kills the running engine.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Full engine argument list for one stage.
    pub fn engine_args(
        &self,
        stage: &StageSpec,
        restore: Option<&Path>,
        reset_optimizer: bool,
        resources: &ResourceDescriptor,
        work_dir: &Path,
    ) -> Result<Vec<String>, TrainingFailure> {
        let mut args = self.engine.args.clone();
        args.push(self.task.data_dir.display().to_string());

        let (beta1, beta2) = stage.optimizer.betas;
        let flags: Vec<(&str, String)> = vec![
            ("arch", stage.architecture.clone()),
            ("encoder-layers", stage.depth.to_string()),
            ("decoder-layers", stage.depth.to_string()),
            ("source-lang", self.task.source_lang.clone()),
            ("target-lang", self.task.target_lang.clone()),
            ("optimizer", stage.optimizer.kind.clone()),
            ("adam-betas", format!("({}, {})", beta1, beta2)),
            ("adam-eps", stage.optimizer.eps.to_string()),
            ("weight-decay", stage.optimizer.weight_decay.to_string()),
            ("clip-norm", stage.optimizer.clip_norm.to_string()),
            ("lr-scheduler", stage.lr.decay.scheduler_name().to_string()),
            ("lr", stage.lr.peak_lr.to_string()),
            ("warmup-updates", stage.lr.warmup_steps.to_string()),
            ("warmup-init-lr", stage.lr.warmup_init_lr.to_string()),
            ("min-lr", stage.lr.min_lr.to_string()),
            ("criterion", "label_smoothed_cross_entropy".to_string()),
            ("label-smoothing", stage.label_smoothing.to_string()),
            ("max-tokens", stage.batch.max_tokens.to_string()),
            ("update-freq", stage.batch.update_freq.to_string()),
            ("max-epoch", stage.max_epoch.to_string()),
            ("log-interval", stage.log_interval.to_string()),
            ("seed", stage.seed.to_string()),
            ("save-dir", work_dir.display().to_string()),
        ];
        for (name, value) in flags {
            args.push(format!("--{}", name));
            args.push(value);
        }
        if let Some(total) = stage.lr.total_steps {
            args.push("--max-update".to_string());
            args.push(total.to_string());
        }
        if resources.worker_count() > 1 {
            args.push("--distributed-world-size".to_string());
            args.push(resources.worker_count().to_string());
        }
        if let Some(path) = restore {
            args.push("--restore-file".to_string());
            args.push(path.display().to_string());
        }
        if reset_optimizer {
            args.extend(RESET_FLAGS.iter().map(|f| f.to_string()));
        }

        let env = Environment::new();
        for template in &self.engine.extra_args {
            let rendered = env
                .render_str(
                    template,
                    context! {
                        stage => stage,
                        task => &self.task,
                        devices => resources.worker_count(),
                        work_dir => work_dir.display().to_string(),
                    },
                )
                .map_err(|e| {
                    TrainingFailure::new(format!("cannot render engine argument '{}': {}", template, e))
                })?;
            if !rendered.trim().is_empty() {
                args.push(rendered);
            }
        }
        Ok(args)
    }

    /// Child command with piped output. Device visibility is set on the child only.
    pub fn command(&self, args: &[String], resources: &ResourceDescriptor) -> Command {
        let mut command = Command::new(&self.engine.program);
        command
            .args(args)
            .env("CUDA_VISIBLE_DEVICES", resources.visible_devices().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn import(
        &self,
        stage: &StageSpec,
        work_dir: &Path,
        tracker: &ProgressTracker,
    ) -> Result<ModelState, TrainingFailure> {
        let model = work_dir.join(ENGINE_CHECKPOINT);
        if !model.is_file() {
            return Err(TrainingFailure::new(format!(
                "engine finished without writing {}",
                model.display()
            )));
        }
        let progress = match read_progress(&work_dir.join(ENGINE_PROGRESS))? {
            Some(p) => p,
            None => tracker.progress(),
        };
        let metadata = stage.metadata().with_progress(progress.epoch, progress.step);
        let mut state = self.store.load_flat(&model, metadata)?;

        let optim = work_dir.join(ENGINE_OPTIMIZER);
        if optim.is_file() {
            state.optimizer_state = Some(load_tensor_map(&optim, &Device::Cpu)?);
        }
        debug!(
            "imported {} tensors from {} (epoch {}, step {})",
            state.tensor_count(),
            model.display(),
            progress.epoch,
            progress.step
        );
        Ok(state)
    }
}

impl TrainingInvoker for ProcessInvoker {
    fn run(
        &mut self,
        stage: &StageSpec,
        initial: Option<&ModelState>,
        resources: &ResourceDescriptor,
        log: &mut StageLog,
    ) -> Result<ModelState, TrainingFailure> {
        check_initial_depth(stage, initial)?;

        let work_dir = stage.output_dir.join(ENGINE_DIR);
        fs::create_dir_all(&work_dir).map_err(|e| {
            TrainingFailure::new(format!("cannot create {}: {}", work_dir.display(), e))
        })?;
        // leftovers from an aborted attempt must not be imported
        for stale in [ENGINE_CHECKPOINT, ENGINE_OPTIMIZER, ENGINE_PROGRESS] {
            remove_if_exists(&work_dir.join(stale))?;
        }

        let restore = match initial {
            Some(state) => {
                let path = work_dir.join(INIT_FILE);
                self.store.save_flat(state, &path)?;
                Some(path)
            }
            None => None,
        };
        let reset = stage.reset_optimizer || initial.is_some_and(|s| s.optimizer_state.is_none());
        let args = self.engine_args(stage, restore.as_deref(), reset, resources, &work_dir)?;

        log.line(format!("$ {} {}", self.engine.program, args.join(" ")))
            .map_err(log_failure)?;
        info!(
            "🏋️ Launching {} for stage {} ({} layers on {})",
            self.engine.program, stage.name, stage.depth, resources
        );

        let mut child = self.command(&args, resources).spawn().map_err(|e| {
            TrainingFailure::new(format!("failed to start {}: {}", self.engine.program, e))
        })?;

        let (tx, rx) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Stream::Stdout, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let interval = Duration::from_secs(self.engine.progress_interval_secs);
        let mut tracker = ProgressTracker::default();
        let mut last_report: Option<Instant> = None;
        let mut last_error_line: Option<String> = None;

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(interrupt(stage, &mut child, log));
            }
            match rx.recv_timeout(POLL) {
                Ok(line) => {
                    if let Err(e) = log.line(&line.text) {
                        stop(&mut child);
                        return Err(log_failure(e));
                    }
                    if line.stream == Stream::Stderr && !line.text.trim().is_empty() {
                        last_error_line = Some(line.text.trim().to_string());
                    }
                    if tracker.observe(&line.text)
                        && last_report.map_or(true, |t| t.elapsed() >= interval)
                    {
                        info!("[{}] {}", stage.name, line.text.trim());
                        last_report = Some(Instant::now());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // output closed; the engine may still be running
        let status = loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(interrupt(stage, &mut child, log));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL),
                Err(e) => {
                    stop(&mut child);
                    return Err(TrainingFailure::new(format!("failed to wait for engine: {}", e)));
                }
            }
        };
        for reader in readers {
            let _ = reader.join();
        }
        if !status.success() {
            let _ = log.line(format!("engine exited with {}", status));
            let detail = last_error_line
                .map(|l| format!(": {}", l))
                .unwrap_or_default();
            return Err(TrainingFailure::new(format!(
                "{} exited with {}{}",
                self.engine.program, status, detail
            ))
            .with_exit_code(status.code()));
        }
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(TrainingFailure::interrupted());
        }

        self.import(stage, &work_dir, &tracker)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: Stream,
    tx: Sender<EngineLine>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for text in reader.lines().map_while(Result::ok) {
            if tx.send(EngineLine { stream, text }).is_err() {
                break;
            }
        }
    })
}

/// Kills the engine. Reader threads finish on their own once the pipes close.
fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn interrupt(stage: &StageSpec, child: &mut Child, log: &mut StageLog) -> TrainingFailure {
    warn!("🛑 Interrupt received, stopping engine for stage {}", stage.name);
    stop(child);
    let _ = log.line("interrupted by operator");
    TrainingFailure::interrupted()
}

fn log_failure(e: std::io::Error) -> TrainingFailure {
    TrainingFailure::new(format!("cannot write stage log: {}", e))
}

fn remove_if_exists(path: &Path) -> Result<(), TrainingFailure> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TrainingFailure::new(format!(
            "cannot remove stale {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_progress(path: &Path) -> Result<Option<EngineProgress>, TrainingFailure> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .map_err(|e| TrainingFailure::new(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| TrainingFailure::new(format!("invalid {}: {}", path.display(), e)))
}
