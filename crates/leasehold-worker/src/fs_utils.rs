//! Durable filesystem helpers.
//!
//! Checkpoints and spool records are written with [`write_atomic`]: the bytes
//! go to a uniquely named temp file in the destination directory, are flushed
//! and forced to stable storage, then renamed over the destination. A reader
//! sees either the previous file or the complete new one, never a torn write.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Atomically write `bytes` to `dst`.
pub async fn write_atomic(dst: impl AsRef<Path>, bytes: &[u8]) -> std::io::Result<()> {
    let dst = dst.as_ref();
    let parent = dst
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if !parent.exists() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(dst);
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, dst).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    sync_dir(parent).await;
    Ok(())
}

/// Move a file within the same filesystem, creating the destination
/// directory if needed.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> std::io::Result<()> {
    let dst = dst.as_ref();
    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::rename(src.as_ref(), dst).await?;
    if let Some(parent) = dst.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

/// Temp files never end in `.json`, so directory scans skip them.
fn temp_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    dst.with_file_name(format!(".{}.tmp.{}", name, Uuid::new_v4().simple()))
}

/// Persist the directory entry itself after a rename.
///
/// Not every platform allows opening a directory for sync; the rename is
/// already visible, so a failure here is only logged.
async fn sync_dir(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                tracing::debug!("Directory sync failed for {}: {}", dir.display(), e);
            }
        }
        Err(e) => tracing::debug!("Could not open {} for sync: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("state.json");

        write_atomic(&dst, b"{\"v\":1}").await.unwrap();
        write_atomic(&dst, b"{\"v\":2}").await.unwrap();

        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "{\"v\":2}");
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        write_atomic(dir.path().join("a.json"), b"{}").await.unwrap();

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parent() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("nested").join("deeper").join("x.json");
        write_atomic(&dst, b"[]").await.unwrap();
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_move_file_to_subdirectory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("record.json");
        let dst = dir.path().join("quarantine").join("record.json");

        fs::write(&src, b"test content").await.unwrap();
        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "test content");
    }
}
