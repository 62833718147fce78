use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{Flock, FlockArg};

/// Cross-process mutex guarding cache-entry creation/deletion and the
/// duplicate-download table. One per configured cache name, backed by an
/// advisory lock on a file so it survives (and is released by) a crashed
/// holder. It is never held across a body-streaming loop.
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn new(cache_name: &str) -> Arc<Self> {
        let path = std::env::temp_dir().join(format!("offload-{cache_name}.lock"));
        Arc::new(Self { path })
    }

    pub fn lock_blocking(&self) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open lock file {}", self.path.display()))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| anyhow!("lock {}: {errno}", self.path.display()))
    }
}

/// Per-request view of the cache lock. Reentrant through a holder counter:
/// only the 0->1 transition takes the file lock and only 1->0 drops it.
/// Dropping the handle releases any residual holds.
pub struct LockHandle {
    lock: Arc<CacheLock>,
    held: Option<Flock<File>>,
    holders: u32,
}

impl LockHandle {
    pub fn new(lock: Arc<CacheLock>) -> Self {
        Self {
            lock,
            held: None,
            holders: 0,
        }
    }

    pub async fn acquire(&mut self) -> Result<()> {
        if self.holders == 0 {
            let lock = Arc::clone(&self.lock);
            let held = tokio::task::spawn_blocking(move || lock.lock_blocking())
                .await
                .context("join lock task")??;
            self.held = Some(held);
        }
        self.holders += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        if self.holders == 0 {
            return;
        }
        self.holders -= 1;
        if self.holders == 0 {
            self.held.take();
        }
    }
}
