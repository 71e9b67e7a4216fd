//! Local per-run progress checkpoints.
//!
//! One JSON file per run under the checkpoint directory. Every mutation is a
//! read-modify-write through [`write_atomic`], so a crash at any point leaves
//! either the previous or the next checkpoint on disk.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use leasehold_models::{Checkpoint, CheckpointTag, LockToken, RunId};

use crate::error::{WorkerError, WorkerResult};
use crate::fs_utils::write_atomic;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>) -> WorkerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            WorkerError::checkpoint(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint file for `run_id`.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`. `%` itself is
    /// always escaped, so distinct ids never share a file.
    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        let mut safe = String::with_capacity(run_id.as_str().len());
        for byte in run_id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
                safe.push(byte as char);
            } else {
                safe.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", safe))
    }

    /// Load the checkpoint for `run_id`; a missing file is an empty checkpoint.
    ///
    /// A file that exists but cannot be parsed, or that records another run,
    /// is a [`WorkerError::Checkpoint`].
    pub async fn load(&self, run_id: &RunId) -> WorkerResult<Checkpoint> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Checkpoint::empty(run_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            WorkerError::checkpoint(format!("checkpoint {} is corrupt: {}", path.display(), e))
        })?;
        if checkpoint.run_id != *run_id {
            return Err(WorkerError::checkpoint(format!(
                "checkpoint {} belongs to run {}, not {}",
                path.display(),
                checkpoint.run_id,
                run_id
            )));
        }
        Ok(checkpoint)
    }

    /// Record `stage` as completed for `run_id`.
    ///
    /// Appending is idempotent: saving an already completed stage only
    /// refreshes `current_stage`, the token and the stored output.
    pub async fn save(
        &self,
        run_id: &RunId,
        stage: &str,
        lock_token: &LockToken,
        data: Option<Value>,
    ) -> WorkerResult<Checkpoint> {
        let mut checkpoint = self.load(run_id).await?;
        if !checkpoint.mark_completed(stage) {
            debug!(run_id = %run_id, stage = %stage, "Stage already checkpointed");
        }
        if let Some(data) = data {
            checkpoint.data.insert(stage.to_string(), data);
        }
        checkpoint.lock_token = Some(lock_token.clone());
        checkpoint.tag = None;

        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Record where a run stopped without completing another stage.
    pub async fn persist_position(
        &self,
        run_id: &RunId,
        stage: Option<&str>,
        lock_token: &LockToken,
        tag: CheckpointTag,
    ) -> WorkerResult<Checkpoint> {
        let mut checkpoint = self.load(run_id).await?;
        if let Some(stage) = stage {
            checkpoint.current_stage = Some(stage.to_string());
        }
        checkpoint.lock_token = Some(lock_token.clone());
        checkpoint.tag = Some(tag);
        checkpoint.updated_at = Utc::now();

        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Delete the checkpoint. Missing files are fine.
    pub async fn clear(&self, run_id: &RunId) -> WorkerResult<()> {
        match fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkerError::checkpoint(format!(
                "cannot remove checkpoint for {}: {}",
                run_id, e
            ))),
        }
    }

    async fn write(&self, checkpoint: &Checkpoint) -> WorkerResult<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.path_for(&checkpoint.run_id);
        write_atomic(&path, &bytes).await.map_err(|e| {
            WorkerError::checkpoint(format!("cannot write {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    async fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_empty() {
        let (_dir, store) = store().await;
        let cp = store.load(&RunId::from_string("r1")).await.unwrap();
        assert!(cp.is_empty());
        assert!(cp.data.is_empty());
    }

    #[tokio::test]
    async fn test_save_appends_and_is_idempotent() {
        let (_dir, store) = store().await;
        let run = RunId::from_string("r1");
        let token = LockToken::generate();

        store.save(&run, "a", &token, Some(serde_json::json!({"n": 1}))).await.unwrap();
        store.save(&run, "b", &token, None).await.unwrap();
        let cp = store.save(&run, "a", &token, None).await.unwrap();

        assert_eq!(cp.completed_stages, vec!["a", "b"]);
        assert_eq!(cp.data["a"]["n"], 1);

        let reloaded = store.load(&run).await.unwrap();
        assert_eq!(reloaded.completed_stages, vec!["a", "b"]);
        assert_eq!(reloaded.lock_token, Some(token));
    }

    #[tokio::test]
    async fn test_persist_position_keeps_completed_stages() {
        let (_dir, store) = store().await;
        let run = RunId::from_string("r1");
        let token = LockToken::generate();

        store.save(&run, "a", &token, None).await.unwrap();
        let cp = store
            .persist_position(&run, Some("b"), &token, CheckpointTag::Interrupted)
            .await
            .unwrap();

        assert_eq!(cp.completed_stages, vec!["a"]);
        assert_eq!(cp.current_stage.as_deref(), Some("b"));
        assert_eq!(cp.tag, Some(CheckpointTag::Interrupted));
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let (_dir, store) = store().await;
        let run = RunId::from_string("r1");
        store.save(&run, "a", &LockToken::generate(), None).await.unwrap();
        assert!(store.path_for(&run).exists());

        assert_ok!(store.clear(&run).await);
        assert!(!store.path_for(&run).exists());
        assert_ok!(store.clear(&run).await);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let (_dir, store) = store().await;
        let run = RunId::from_string("r1");
        fs::write(store.path_for(&run), b"{ not json").await.unwrap();

        let err = assert_err!(store.load(&run).await);
        assert!(matches!(err, WorkerError::Checkpoint(_)));
    }

    #[test]
    fn test_path_is_sanitized() {
        let store = CheckpointStore {
            dir: PathBuf::from("/tmp/cp"),
        };
        let path = store.path_for(&RunId::from_string("../etc/passwd"));
        assert_eq!(path, PathBuf::from("/tmp/cp/%2E%2E%2Fetc%2Fpasswd.json"));
        assert_eq!(path.parent(), Some(Path::new("/tmp/cp")));
    }

    #[test]
    fn test_similar_ids_get_distinct_paths() {
        let store = CheckpointStore {
            dir: PathBuf::from("/tmp/cp"),
        };
        let ids = ["job:1", "job_1", "job/1", "job%3A1", "job.1"];
        let paths: std::collections::HashSet<_> = ids
            .iter()
            .map(|id| store.path_for(&RunId::from_string(*id)))
            .collect();
        assert_eq!(paths.len(), ids.len());
    }

    #[tokio::test]
    async fn test_similar_ids_keep_separate_progress() {
        let (_dir, store) = store().await;
        let colon = RunId::from_string("job:1");
        let underscore = RunId::from_string("job_1");

        assert_ok!(store.save(&colon, "a", &LockToken::generate(), None).await);

        let other = assert_ok!(store.load(&underscore).await);
        assert!(other.is_empty());
        assert_eq!(other.run_id, underscore);
        assert_eq!(store.load(&colon).await.unwrap().completed_stages, vec!["a"]);
    }

    #[tokio::test]
    async fn test_checkpoint_for_another_run_is_rejected() {
        let (_dir, store) = store().await;
        let run = RunId::from_string("r1");
        let foreign = Checkpoint::empty(RunId::from_string("r2"));
        fs::write(store.path_for(&run), serde_json::to_vec(&foreign).unwrap())
            .await
            .unwrap();

        let err = assert_err!(store.load(&run).await);
        assert!(matches!(err, WorkerError::Checkpoint(_)));
        assert!(err.to_string().contains("belongs to run r2"));
    }
}
