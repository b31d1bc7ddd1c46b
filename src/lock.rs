//! Process-singleton lock file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;

/// Exclusive advisory lock held for the lifetime of the value. The file
/// records the holder's pid for humans; the lock itself is the flock.
#[derive(Debug)]
pub struct InstanceLock {
    file: std::fs::File,
}

impl InstanceLock {
    pub async fn acquire(path: &Path) -> anyhow::Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path)).await?
    }

    fn acquire_blocking(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory: {}", parent.display())
            })?;
        }
        // Do not truncate before holding the lock: the pid belongs to the holder.
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            let holder = std::fs::read_to_string(&path).unwrap_or_default();
            anyhow::anyhow!(
                "Another dsnapshot instance is already running (pid: {}, lock: {})",
                holder.trim(),
                path.display()
            )
        })?;

        write_pid(&mut file)
            .with_context(|| format!("Failed to write lock file: {}", path.display()))?;
        tracing::debug!("Acquired lock {}", path.display());
        Ok(Self { file })
    }
}

fn write_pid(file: &mut std::fs::File) -> std::io::Result<()> {
    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_records_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/lockfile");
        let _lock = InstanceLock::acquire(&path).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[tokio::test]
    async fn test_second_instance_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lockfile");
        let _held = InstanceLock::acquire(&path).await.unwrap();
        let err = InstanceLock::acquire(&path).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lockfile");
        drop(InstanceLock::acquire(&path).await.unwrap());
        InstanceLock::acquire(&path).await.unwrap();
    }
}
