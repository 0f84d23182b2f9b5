// Trainer snapshots and checkpoint management

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use super::{EpisodeGoal, TrainRng};
use crate::config::Config;
use crate::errors::{checkpoint_restore_error, SnapshotError, UserFriendlyError};
use crate::sim::SensorState;

/// Schema version written into every snapshot
pub const SNAPSHOT_VERSION: u64 = 1;

const SNAPSHOT_FILE: &str = "trainer.json";

/// Persisted state of one episode slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSnapshot {
    pub context: u8,
    /// Opaque environment state, `None` when no environment was built yet
    pub env: Option<serde_json::Value>,
    /// Last sensors, `None` for a terminated episode
    pub state: Option<SensorState>,
    pub goal: Option<EpisodeGoal>,
}

/// Everything needed to continue training exactly where it stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSnapshot {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    /// Next epoch to run
    pub epoch: usize,
    pub rng: TrainRng,
    /// `[epochs, 3]` rows of min/mean/max competence
    pub logs: Array2<f64>,
    pub model: serde_json::Value,
    pub episodes: Vec<EpisodeSnapshot>,
    /// Episodes whose goal must be resampled next epoch
    pub reset_goal: Vec<bool>,
    pub max_match: Array1<f64>,
    pub config: Config,
}

impl TrainerSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize trainer snapshot")
    }

    /// Decode a snapshot and migrate it to `config`.
    ///
    /// The schema version is checked before anything else is parsed. A log
    /// array shorter than `config.epochs` is grown with zero rows.
    pub fn from_bytes(bytes: &[u8], config: &Config) -> Result<Self, SnapshotError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or(SnapshotError::MissingVersion)?;
        if version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let mut snapshot: Self = serde_json::from_value(raw)?;
        if snapshot.episodes.len() != config.batch_size || snapshot.reset_goal.len() != config.batch_size {
            return Err(SnapshotError::BatchSizeMismatch {
                found: snapshot.episodes.len(),
                expected: config.batch_size,
            });
        }

        snapshot.logs = migrate_logs(snapshot.logs, config.epochs);
        Ok(snapshot)
    }
}

/// Grow the log array to `epochs` rows, keeping existing rows in place.
/// Logs are never shrunk.
pub fn migrate_logs(logs: Array2<f64>, epochs: usize) -> Array2<f64> {
    let (rows, cols) = logs.dim();
    if rows >= epochs {
        return logs;
    }

    tracing::info!(from = rows, to = epochs, "Growing log array for new epoch count");
    let mut grown = Array2::zeros((epochs, cols));
    grown.slice_mut(s![..rows, ..]).assign(&logs);
    grown
}

/// Epoch-keyed checkpoint directories under the storage root
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    storage_dir: PathBuf,
    /// Newest epoch directories to keep, 0 keeps all
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(storage_dir: PathBuf, max_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(&storage_dir)
            .with_context(|| format!("Failed to create storage directory: {:?}", storage_dir))?;

        Ok(Self {
            storage_dir,
            max_checkpoints,
        })
    }

    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.storage_dir.join(format!("{:06}", epoch))
    }

    /// Write `snapshot` into the directory of `epoch`
    pub fn save(&self, epoch: usize, snapshot: &TrainerSnapshot) -> Result<PathBuf> {
        let dir = self.epoch_dir(epoch);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

        let path = dir.join(SNAPSHOT_FILE);
        let partial = dir.join(format!("{}.partial", SNAPSHOT_FILE));
        fs::write(&partial, snapshot.to_bytes()?)
            .with_context(|| format!("Failed to write trainer snapshot: {:?}", partial))?;
        fs::rename(&partial, &path).with_context(|| format!("Failed to move trainer snapshot into place: {:?}", path))?;

        tracing::info!(
            epoch,
            next_epoch = snapshot.epoch,
            path = ?path,
            "Saved trainer checkpoint"
        );

        self.cleanup_old_checkpoints()?;
        Ok(dir)
    }

    /// Epochs holding a snapshot, newest first
    pub fn list_epochs(&self) -> Result<Vec<usize>> {
        let mut epochs = Vec::new();
        if !self.storage_dir.exists() {
            return Ok(epochs);
        }

        for entry in fs::read_dir(&self.storage_dir)
            .with_context(|| format!("Failed to read storage directory: {:?}", self.storage_dir))?
        {
            let path = entry?.path();
            if !path.join(SNAPSHOT_FILE).is_file() {
                continue;
            }
            if let Some(epoch) = path.file_name().and_then(|n| n.to_str()).and_then(|n| n.parse().ok()) {
                epochs.push(epoch);
            }
        }

        epochs.sort_unstable_by(|a, b| b.cmp(a));
        Ok(epochs)
    }

    pub fn latest(&self) -> Result<Option<usize>> {
        Ok(self.list_epochs()?.into_iter().next())
    }

    pub fn load(&self, epoch: usize, config: &Config) -> Result<TrainerSnapshot> {
        let path = self.epoch_dir(epoch).join(SNAPSHOT_FILE);
        let bytes = fs::read(&path).with_context(|| format!("Failed to read trainer snapshot: {:?}", path))?;
        let snapshot = TrainerSnapshot::from_bytes(&bytes, config)
            .map_err(anyhow::Error::from)
            .user_context(&checkpoint_restore_error(&path.display().to_string()))?;

        tracing::info!(
            epoch,
            next_epoch = snapshot.epoch,
            created_at = %snapshot.created_at,
            "Restored trainer checkpoint"
        );
        Ok(snapshot)
    }

    pub fn load_latest(&self, config: &Config) -> Result<Option<TrainerSnapshot>> {
        match self.latest()? {
            Some(epoch) => self.load(epoch, config).map(Some),
            None => Ok(None),
        }
    }

    pub fn delete(&self, epoch: usize) -> Result<()> {
        let dir = self.epoch_dir(epoch);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("Failed to delete checkpoint directory: {:?}", dir))?;
            tracing::info!(epoch, "Deleted checkpoint");
        }
        Ok(())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        if self.max_checkpoints == 0 {
            return Ok(());
        }

        let epochs = self.list_epochs()?;
        if epochs.len() > self.max_checkpoints {
            let to_delete = &epochs[self.max_checkpoints..];
            for &epoch in to_delete {
                self.delete(epoch)?;
            }

            tracing::info!(
                deleted = to_delete.len(),
                kept = self.max_checkpoints,
                "Cleaned up old checkpoints"
            );
        }
        Ok(())
    }
}

/// Start-up state of a training process
#[derive(Debug)]
pub enum ResumeState {
    /// No checkpoint on disk, start from the configured seed
    Fresh,
    Restore(Box<TrainerSnapshot>),
}

impl ResumeState {
    pub fn detect(manager: &CheckpointManager, config: &Config) -> Result<Self> {
        Ok(match manager.load_latest(config)? {
            Some(snapshot) => ResumeState::Restore(Box::new(snapshot)),
            None => ResumeState::Fresh,
        })
    }
}
