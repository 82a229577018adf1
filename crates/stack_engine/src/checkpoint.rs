//! Checkpoint Store - durable ModelState persistence
//!
//! A checkpoint is a directory:
//! - `model.safetensors`     layer, history and shared tensors (flat keys)
//! - `optimizer.safetensors` optimizer tensors, only when present
//! - `checkpoint.json`       manifest, written last
//!
//! A checkpoint is discoverable only once its manifest exists, so readers
//! never see a half-written one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StackError, StackResult};
use crate::model::{ModelState, StateMetadata, TensorMap};

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const MANIFEST_FILE: &str = "checkpoint.json";
const LOCK_FILE: &str = ".checkpoint.lock";
const MANIFEST_VERSION: u32 = 1;

/// Manifest stored next to the tensor files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub metadata: StateMetadata,
    pub model_file: String,
    #[serde(default)]
    pub optimizer_file: Option<String>,
    pub tensor_count: usize,
    pub parameter_count: usize,
    pub saved_at: DateTime<Utc>,
}

/// Reads and writes checkpoint directories.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    device: Device,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore {
    /// Store that materializes tensors on the CPU.
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    pub fn manifest_path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// True when `dir` holds a fully written checkpoint.
    pub fn is_completed(&self, dir: impl AsRef<Path>) -> bool {
        Self::manifest_path(dir.as_ref()).is_file()
    }

    pub fn read_manifest(&self, dir: impl AsRef<Path>) -> StackResult<CheckpointManifest> {
        let dir = dir.as_ref();
        let path = Self::manifest_path(dir);
        if !path.is_file() {
            return Err(StackError::not_found(dir));
        }
        let reader = BufReader::new(File::open(&path)?);
        let manifest: CheckpointManifest = serde_json::from_reader(reader)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StackError::corrupt(format!(
                "{} has manifest version {}, expected {}",
                path.display(),
                manifest.version,
                MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Loads the checkpoint stored in `dir`.
    pub fn load(&self, dir: impl AsRef<Path>) -> StackResult<ModelState> {
        let dir = dir.as_ref();
        let manifest = self.read_manifest(dir)?;

        let tensors = candle_core::safetensors::load(dir.join(&manifest.model_file), &self.device)?;
        if tensors.len() != manifest.tensor_count {
            return Err(StackError::corrupt(format!(
                "{} holds {} tensors, manifest lists {}",
                dir.display(),
                tensors.len(),
                manifest.tensor_count
            )));
        }
        let mut state = ModelState::from_flat(tensors, manifest.metadata)?;

        if let Some(ref optim) = manifest.optimizer_file {
            let optim = candle_core::safetensors::load(dir.join(optim), &self.device)?;
            state.optimizer_state = Some(optim.into_iter().collect());
        }

        debug!(
            "Loaded checkpoint {} ({} tensors, epoch {}, step {})",
            dir.display(),
            manifest.tensor_count,
            state.metadata.epoch,
            state.metadata.step
        );
        Ok(state)
    }

    /// Writes `state` into `dir`, replacing any checkpoint already there.
    ///
    /// The old manifest is removed first and the new one is renamed into
    /// place last, so `dir` is never discoverable in a mixed state.
    pub fn save(&self, state: &ModelState, dir: impl AsRef<Path>) -> StackResult<CheckpointManifest> {
        let dir = dir.as_ref();
        state.validate()?;
        fs::create_dir_all(dir)?;

        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file.lock_exclusive()?;

        let manifest_path = Self::manifest_path(dir);
        if manifest_path.exists() {
            warn!("Replacing existing checkpoint at {}", dir.display());
            fs::remove_file(&manifest_path)?;
        }

        write_tensors_atomic(&state.to_flat(), &dir.join(MODEL_FILE))?;

        let optimizer_file = match state.optimizer_state {
            Some(ref optim) => {
                let flat: HashMap<String, Tensor> =
                    optim.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                write_tensors_atomic(&flat, &dir.join(OPTIMIZER_FILE))?;
                Some(OPTIMIZER_FILE.to_string())
            }
            None => {
                let stale = dir.join(OPTIMIZER_FILE);
                if stale.exists() {
                    fs::remove_file(stale)?;
                }
                None
            }
        };

        let manifest = CheckpointManifest {
            version: MANIFEST_VERSION,
            metadata: state.metadata.clone(),
            model_file: MODEL_FILE.to_string(),
            optimizer_file,
            tensor_count: state.tensor_count(),
            parameter_count: state.parameter_count(),
            saved_at: Utc::now(),
        };
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &manifest)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &manifest_path)?;

        lock_file.unlock()?;

        info!(
            "💾 Saved checkpoint {} ({}: {} enc / {} dec layers, {:.2}M params)",
            dir.display(),
            manifest.metadata.architecture,
            manifest.metadata.encoder_layers,
            manifest.metadata.decoder_layers,
            manifest.parameter_count as f64 / 1_000_000.0
        );
        Ok(manifest)
    }

    /// Path of the most recently completed checkpoint under `dir`.
    ///
    /// `dir` itself wins if it is a checkpoint; otherwise its child
    /// directories are searched and the newest `saved_at` is returned.
    pub fn latest_path(&self, dir: impl AsRef<Path>) -> StackResult<PathBuf> {
        let dir = dir.as_ref();
        if self.is_completed(dir) {
            return Ok(dir.to_path_buf());
        }

        let pattern = dir.join("*").join(MANIFEST_FILE);
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| StackError::corrupt(format!("bad checkpoint search pattern: {}", e)))?;

        let mut best: Option<(DateTime<Utc>, PathBuf)> = None;
        for entry in entries {
            let manifest_path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("⚠️ Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let Some(candidate) = manifest_path.parent().map(Path::to_path_buf) else {
                continue;
            };
            match self.read_manifest(&candidate) {
                Ok(m) => {
                    let newer = match best {
                        Some((ref at, ref path)) => (m.saved_at, &candidate) > (*at, path),
                        None => true,
                    };
                    if newer {
                        best = Some((m.saved_at, candidate));
                    }
                }
                Err(e) => warn!("⚠️ Ignoring checkpoint {}: {}", candidate.display(), e),
            }
        }

        best.map(|(_, path)| path)
            .ok_or_else(|| StackError::not_found(dir))
    }

    /// Loads the most recently completed checkpoint under `dir`.
    pub fn latest(&self, dir: impl AsRef<Path>) -> StackResult<ModelState> {
        let path = self.latest_path(dir)?;
        self.load(path)
    }

    /// Reads a flat `.safetensors` file written by a training engine.
    ///
    /// Keys are classified with the checkpoint key grammar and validated
    /// against `metadata`.
    pub fn load_flat(&self, file: impl AsRef<Path>, metadata: StateMetadata) -> StackResult<ModelState> {
        let file = file.as_ref();
        if !file.is_file() {
            return Err(StackError::not_found(file));
        }
        let tensors = candle_core::safetensors::load(file, &self.device)?;
        ModelState::from_flat(tensors, metadata)
    }

    /// Writes model (and optimizer, if present) tensors as flat files for a
    /// training engine: `file` and `file` with an `.optim.safetensors` suffix.
    pub fn save_flat(&self, state: &ModelState, file: impl AsRef<Path>) -> StackResult<Option<PathBuf>> {
        let file = file.as_ref();
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        write_tensors_atomic(&state.to_flat(), file)?;
        match state.optimizer_state {
            Some(ref optim) => {
                let path = file.with_extension("optim.safetensors");
                let flat: HashMap<String, Tensor> =
                    optim.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                write_tensors_atomic(&flat, &path)?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }
}

/// Loads an optimizer tensor file into an ordered map.
pub fn load_tensor_map(file: impl AsRef<Path>, device: &Device) -> StackResult<TensorMap> {
    let tensors = candle_core::safetensors::load(file.as_ref(), device)?;
    Ok(tensors.into_iter().collect())
}

/// Writes to `<path>.tmp`, syncs, then renames over `path`.
fn write_tensors_atomic(tensors: &HashMap<String, Tensor>, path: &Path) -> StackResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    candle_core::safetensors::save(tensors, &tmp)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::keys::layer_key;
    use crate::model::Role;
    use candle_core::DType;

    fn tiny_state(depth: usize) -> ModelState {
        let dev = Device::Cpu;
        let mut flat = vec![(
            "decoder.embed_out".to_string(),
            Tensor::ones((5, 2), DType::F32, &dev).unwrap(),
        )];
        for role in Role::ALL {
            for i in 0..depth {
                flat.push((
                    layer_key(role, i, "fc1.weight"),
                    Tensor::full(i as f32, (2, 2), &dev).unwrap(),
                ));
            }
        }
        ModelState::from_flat(flat, StateMetadata::new("tiny", depth, depth)).unwrap()
    }

    #[test]
    fn test_missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new();
        assert!(!store.is_completed(dir.path()));
        let err = store.load(dir.path()).unwrap_err();
        assert!(matches!(err, StackError::NotFound(_)), "{err}");
    }

    #[test]
    fn test_save_leaves_no_temporaries() -> StackResult<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new();
        let mut state = tiny_state(2);
        state.optimizer_state = Some(
            [(
                "exp_avg.0".to_string(),
                Tensor::zeros(3, DType::F32, &Device::Cpu)?,
            )]
            .into_iter()
            .collect(),
        );
        let manifest = store.save(&state, dir.path())?;
        assert_eq!(manifest.tensor_count, 5);
        assert_eq!(manifest.optimizer_file.as_deref(), Some(OPTIMIZER_FILE));

        let leftovers: Vec<_> = fs::read_dir(dir.path())?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_resave_without_optimizer_removes_stale_file() -> StackResult<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new();
        let mut state = tiny_state(1);
        state.optimizer_state = Some(
            [("step".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu)?)]
                .into_iter()
                .collect(),
        );
        store.save(&state, dir.path())?;
        assert!(dir.path().join(OPTIMIZER_FILE).exists());

        state.optimizer_state = None;
        store.save(&state, dir.path())?;
        assert!(!dir.path().join(OPTIMIZER_FILE).exists());
        assert!(store.load(dir.path())?.optimizer_state.is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_manifest_version_is_corrupt() -> StackResult<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new();
        store.save(&tiny_state(1), dir.path())?;

        let path = CheckpointStore::manifest_path(dir.path());
        let mut json: serde_json::Value = serde_json::from_reader(File::open(&path)?)?;
        json["version"] = serde_json::json!(99);
        serde_json::to_writer(File::create(&path)?, &json)?;

        let err = store.load(dir.path()).unwrap_err();
        assert!(matches!(err, StackError::CorruptState(_)), "{err}");
        Ok(())
    }
}
