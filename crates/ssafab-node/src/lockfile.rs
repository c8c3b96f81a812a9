//! Single-instance pidfile.
//!
//! One daemon per host: the lock file records the owning PID. A stale
//! file left by a dead process is reclaimed; contention with a live
//! process is a startup failure (exit code 1) with a log line naming
//! the PID and path.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::warn;

/// A held pidfile, removed on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock or fails naming the holder.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock dir {}", parent.display()))?;
        }

        match fs::read_to_string(path) {
            Ok(contents) => {
                let holder: Option<u32> = contents.trim().parse().ok();
                if let Some(pid) = holder {
                    if pid_alive(pid) {
                        bail!(
                            "lock file {} held by running pid {pid}",
                            path.display()
                        );
                    }
                    warn!(pid, path = %path.display(), "reclaiming stale lock file");
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        }

        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssafab.pid");

        let lock = LockFile::acquire(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn contention_with_live_pid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssafab.pid");
        // Our own PID is certainly alive.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(LockFile::acquire(&path).is_err());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssafab.pid");
        // PID 0 is never a live userspace process.
        fs::write(&path, "0\n").unwrap();
        let lock = LockFile::acquire(&path).unwrap();
        drop(lock);
    }
}
