//! Local durable spool of panic events.
//!
//! Layout:
//! ```text
//! spool/
//!   {ts_ms}_{event_id}.json     pending delivery
//!   bad/                        unparseable records
//!   quarantine/                 records past their retry budget
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use leasehold_models::PanicEvent;

use crate::error::{WorkerError, WorkerResult};
use crate::fs_utils::{move_file, write_atomic};

const BAD_DIR: &str = "bad";
const QUARANTINE_DIR: &str = "quarantine";

/// A spooled panic event plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub event: PanicEvent,
    /// Delivery attempts so far, including the inline one
    #[serde(default)]
    pub attempts: u32,
    /// Remote status patch and event row were both accepted
    #[serde(default)]
    pub remote_acked: bool,
    /// Operator alert was delivered
    #[serde(default)]
    pub alert_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub spooled_at: DateTime<Utc>,
}

impl SpoolRecord {
    pub fn new(event: PanicEvent) -> Self {
        Self {
            event,
            attempts: 0,
            remote_acked: false,
            alert_sent: false,
            last_error: None,
            spooled_at: Utc::now(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.remote_acked && self.alert_sent
    }
}

#[derive(Debug, Clone)]
pub struct PanicSpool {
    dir: PathBuf,
}

impl PanicSpool {
    pub async fn new(dir: impl Into<PathBuf>) -> WorkerResult<Self> {
        let dir = dir.into();
        for sub in [dir.clone(), dir.join(BAD_DIR), dir.join(QUARANTINE_DIR)] {
            fs::create_dir_all(&sub).await.map_err(|e| {
                WorkerError::spool(format!("cannot create {}: {}", sub.display(), e))
            })?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.dir.join(QUARANTINE_DIR)
    }

    pub fn bad_dir(&self) -> PathBuf {
        self.dir.join(BAD_DIR)
    }

    /// File name for an event: millisecond timestamp, then the event id.
    pub fn file_name(event: &PanicEvent) -> String {
        format!("{}_{}.json", event.timestamp.timestamp_millis(), event.event_id)
    }

    /// Durably write a new record. Returns its path only once the bytes are
    /// on stable storage.
    pub async fn write(&self, record: &SpoolRecord) -> WorkerResult<PathBuf> {
        let path = self.dir.join(Self::file_name(&record.event));
        self.write_to(&path, record).await?;
        Ok(path)
    }

    /// Rewrite an existing record in place.
    pub async fn update(&self, path: &Path, record: &SpoolRecord) -> WorkerResult<()> {
        self.write_to(path, record).await
    }

    async fn write_to(&self, path: &Path, record: &SpoolRecord) -> WorkerResult<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| WorkerError::spool(format!("cannot encode panic event: {}", e)))?;
        write_atomic(path, &bytes)
            .await
            .map_err(|e| WorkerError::spool(format!("cannot write {}: {}", path.display(), e)))
    }

    /// Pending records, oldest first.
    pub async fn list(&self) -> WorkerResult<Vec<PathBuf>> {
        let mut paths = json_files(&self.dir).await?;
        paths.sort();
        Ok(paths)
    }

    /// Parse a record. A malformed file is [`WorkerError::Json`].
    pub async fn read(&self, path: &Path) -> WorkerResult<SpoolRecord> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn remove(&self, path: &Path) -> WorkerResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn quarantine(&self, path: &Path) -> WorkerResult<PathBuf> {
        self.move_into(path, self.quarantine_dir()).await
    }

    pub async fn move_to_bad(&self, path: &Path) -> WorkerResult<PathBuf> {
        self.move_into(path, self.bad_dir()).await
    }

    async fn move_into(&self, path: &Path, dir: PathBuf) -> WorkerResult<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| WorkerError::spool(format!("{} has no file name", path.display())))?;
        let dst = dir.join(name);
        move_file(path, &dst).await?;
        Ok(dst)
    }

    /// Records sitting in quarantine.
    pub async fn quarantine_count(&self) -> WorkerResult<usize> {
        Ok(json_files(&self.quarantine_dir()).await?.len())
    }
}

async fn json_files(dir: &Path) -> WorkerResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_models::{PanicReason, RunId, WorkerId};
    use tempfile::TempDir;

    fn event() -> PanicEvent {
        PanicEvent::new(
            RunId::from_string("run-1"),
            WorkerId::from_string("w1"),
            PanicReason::LostLock,
            "token mismatch",
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let spool = PanicSpool::new(dir.path().join("spool")).await.unwrap();
        let record = SpoolRecord::new(event());

        let path = spool.write(&record).await.unwrap();
        assert_eq!(spool.list().await.unwrap(), vec![path.clone()]);
        assert_eq!(spool.read(&path).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_same_millisecond_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let spool = PanicSpool::new(dir.path()).await.unwrap();

        let first = event();
        let mut second = event();
        second.timestamp = first.timestamp;

        let a = spool.write(&SpoolRecord::new(first)).await.unwrap();
        let b = spool.write(&SpoolRecord::new(second)).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(spool.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_quarantine_and_bad_are_not_listed() {
        let dir = TempDir::new().unwrap();
        let spool = PanicSpool::new(dir.path()).await.unwrap();

        let a = spool.write(&SpoolRecord::new(event())).await.unwrap();
        let b = spool.write(&SpoolRecord::new(event())).await.unwrap();
        spool.quarantine(&a).await.unwrap();
        spool.move_to_bad(&b).await.unwrap();

        assert!(spool.list().await.unwrap().is_empty());
        assert_eq!(spool.quarantine_count().await.unwrap(), 1);
        assert!(spool.bad_dir().join(b.file_name().unwrap()).exists());
    }

    #[tokio::test]
    async fn test_malformed_record_is_json_error() {
        let dir = TempDir::new().unwrap();
        let spool = PanicSpool::new(dir.path()).await.unwrap();
        let path = dir.path().join("0_broken.json");
        fs::write(&path, b"{\"event\":").await.unwrap();

        assert!(matches!(
            spool.read(&path).await,
            Err(WorkerError::Json(_))
        ));
    }
}
