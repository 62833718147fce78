use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::constants::DUPE_SLOT_COUNT;
use crate::lock::{CacheLock, LockHandle};

const SLOT_SIZE: usize = 24; // u32 pid (LE) + 20-byte digest

/// Fixed-size table capping concurrent downloads per (client address, URI).
/// Rows live in a file scoped by cache name so every instance sharing the
/// cache sees the same table; a row is free when its pid is zero or dead.
/// When the table is full new downloads are admitted untracked (soft cap).
pub struct DownloadRegistry {
    path: PathBuf,
    cap: u32,
}

pub enum Admission {
    Granted(Option<SlotGuard>),
    Rejected,
}

enum Claim {
    Slot(usize),
    Untracked,
    Rejected,
}

impl DownloadRegistry {
    pub fn new(cache_name: &str, cap: u32) -> Arc<Self> {
        let path = std::env::temp_dir().join(format!("offload-{cache_name}.slots"));
        Arc::new(Self { path, cap })
    }

    pub fn enabled(&self) -> bool {
        self.cap > 0
    }

    /// Table reads and writes only happen while the cache mutex is held.
    pub async fn admit(
        self: &Arc<Self>,
        handle: &mut LockHandle,
        lock: &Arc<CacheLock>,
        client_ip: &str,
        uri: &str,
    ) -> Result<Admission> {
        if !self.enabled() {
            return Ok(Admission::Granted(None));
        }
        let digest = download_digest(client_ip, uri);
        handle.acquire().await?;
        let claim = self.claim(&digest);
        handle.release();
        match claim? {
            Claim::Rejected => Ok(Admission::Rejected),
            Claim::Untracked => Ok(Admission::Granted(None)),
            Claim::Slot(index) => Ok(Admission::Granted(Some(SlotGuard {
                registry: Arc::clone(self),
                lock: Arc::clone(lock),
                index,
            }))),
        }
    }

    fn claim(&self, digest: &[u8; 20]) -> Result<Claim> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open slot table {}", self.path.display()))?;
        let table_len = DUPE_SLOT_COUNT * SLOT_SIZE;
        if file.metadata().context("stat slot table")?.len() < table_len as u64 {
            file.set_len(table_len as u64).context("size slot table")?;
        }
        let mut table = vec![0u8; table_len];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut table).context("read slot table")?;

        // Every live matching row counts as a duplicate. The table spans
        // processes sharing this cache, and within one server process all
        // request tasks report the same pid.
        let mut dupes = 0u32;
        let mut free = None;
        for idx in 0..DUPE_SLOT_COUNT {
            let row = &table[idx * SLOT_SIZE..][..SLOT_SIZE];
            let pid = u32::from_le_bytes(row[..4].try_into().unwrap());
            if pid == 0 || !process_alive(pid) {
                if free.is_none() {
                    free = Some(idx);
                }
                continue;
            }
            if row[4..SLOT_SIZE] == digest[..] {
                dupes += 1;
            }
        }

        if dupes >= self.cap {
            return Ok(Claim::Rejected);
        }
        let Some(idx) = free else {
            return Ok(Claim::Untracked);
        };
        let mut row = [0u8; SLOT_SIZE];
        row[..4].copy_from_slice(&std::process::id().to_le_bytes());
        row[4..].copy_from_slice(digest);
        file.seek(SeekFrom::Start((idx * SLOT_SIZE) as u64))?;
        file.write_all(&row).context("write slot")?;
        Ok(Claim::Slot(idx))
    }

    fn clear(&self, index: usize) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open slot table {}", self.path.display()))?;
        file.seek(SeekFrom::Start((index * SLOT_SIZE) as u64))?;
        file.write_all(&[0u8; SLOT_SIZE]).context("clear slot")?;
        Ok(())
    }
}

/// Released on every request exit path, including disconnects and errors.
pub struct SlotGuard {
    registry: Arc<DownloadRegistry>,
    lock: Arc<CacheLock>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        match self.lock.lock_blocking() {
            Ok(_held) => {
                if let Err(err) = self.registry.clear(self.index) {
                    log::warn!("failed to clear download slot {}: {err}", self.index);
                }
            }
            Err(err) => log::warn!("failed to lock for slot release: {err}"),
        }
    }
}

// SHA-1 here is a fixed-width fingerprint, not a security boundary; a
// collision only risks a spurious duplicate rejection.
pub fn download_digest(client_ip: &str, uri: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(client_ip.as_bytes());
    hasher.update([0u8]);
    hasher.update(uri.as_bytes());
    hasher.update([0u8]);
    let out = hasher.finalize();
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&out);
    digest
}

pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(errno) => errno != nix::errno::Errno::ESRCH,
    }
}
