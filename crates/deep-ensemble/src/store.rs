use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ensemble_core::{CheckpointKey, EnsembleError, EnsembleResult, ModelStore, ModelWeights};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Checkpoints held in process memory.
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    checkpoints: DashMap<CheckpointKey, ModelWeights>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn contains(&self, key: CheckpointKey) -> bool {
        self.checkpoints.contains_key(&key)
    }
}

impl ModelStore for MemoryModelStore {
    fn put(&self, key: CheckpointKey, weights: &ModelWeights) -> EnsembleResult<()> {
        self.checkpoints.insert(key, weights.clone());
        Ok(())
    }

    fn get(&self, key: CheckpointKey) -> EnsembleResult<ModelWeights> {
        self.checkpoints
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EnsembleError::checkpoint(key, "no checkpoint stored"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    key: CheckpointKey,
    saved_at: DateTime<Utc>,
    weights: ModelWeights,
}

/// One JSON file per checkpoint under `root`, named `fold_{fold}_nll_{member}.json`.
#[derive(Debug, Clone)]
pub struct FileModelStore {
    root: PathBuf,
}

impl FileModelStore {
    pub fn new(root: impl Into<PathBuf>) -> EnsembleResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: CheckpointKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl ModelStore for FileModelStore {
    fn put(&self, key: CheckpointKey, weights: &ModelWeights) -> EnsembleResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let file = CheckpointFile {
            key,
            saved_at: Utc::now(),
            weights: weights.clone(),
        };
        let body = serde_json::to_vec(&file)?;
        fs::write(&tmp, body)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                EnsembleError::checkpoint(key, format!("failed to write {}: {}", path.display(), e))
            })?;
        tracing::debug!("Saved checkpoint {}", path.display());
        Ok(())
    }

    fn get(&self, key: CheckpointKey) -> EnsembleResult<ModelWeights> {
        let path = self.path_for(key);
        let body = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                EnsembleError::checkpoint(key, format!("{} not found", path.display()))
            }
            _ => EnsembleError::checkpoint(key, format!("failed to read {}: {}", path.display(), e)),
        })?;
        let file: CheckpointFile = serde_json::from_slice(&body).map_err(|e| {
            EnsembleError::checkpoint(key, format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        if file.key != key {
            return Err(EnsembleError::checkpoint(
                key,
                format!("{} holds checkpoint {}", path.display(), file.key),
            ));
        }
        Ok(file.weights)
    }
}
