use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::constants::TRANSFER_CHUNK;
use crate::lock::{CacheLock, LockHandle};
use crate::store::{self, EntryPaths};

pub type BoxedBody = BoxBody<Bytes, std::io::Error>;

pub fn full_body(bytes: Bytes) -> BoxedBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxedBody {
    full_body(Bytes::new())
}

#[derive(Debug, Clone, Copy)]
pub struct ReadPlan {
    pub start: i64,
    pub end: i64, // inclusive
    pub total: i64,
    pub stall_timeout: Duration,
}

/// Streams `[start, end]` of a filedata file to the client, pacing itself
/// by the file's growing size when a caching writer is still filling it.
/// `keep` is dropped when the stream ends on any path, which releases the
/// request's download slot.
pub fn reader_body(
    file: tokio::fs::File,
    plan: ReadPlan,
    keep: Option<crate::dupes::SlotGuard>,
) -> BoxedBody {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(8);
    tokio::spawn(async move {
        let _keep = keep;
        run_reader(file, plan, tx).await;
    });
    StreamBody::new(rx).boxed()
}

async fn run_reader(
    mut file: tokio::fs::File,
    plan: ReadPlan,
    mut tx: mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>,
) {
    let end = plan.end + 1; // exclusive
    let mut consumed: i64 = 0;
    let mut last_read = Instant::now();
    let mut buf = vec![0u8; TRANSFER_CHUNK];

    while consumed < end {
        // bytes below `start` are read and thrown away rather than seeked
        // past, so the wait logic below tracks writer progress exactly
        let mut readsize = plan.start - consumed;
        if readsize <= 0 || readsize > TRANSFER_CHUNK as i64 {
            readsize = TRANSFER_CHUNK as i64;
        }
        if readsize > end - consumed {
            readsize = end - consumed;
        }
        if readsize == 0 {
            break;
        }

        let cursize = match file.metadata().await {
            Ok(stat) => stat.len() as i64,
            Err(err) => {
                log::debug!("fstat on cache file failed: {err}");
                break;
            }
        };
        if cursize < plan.total && cursize - consumed <= 0 {
            // the writer has not produced these bytes yet
            if last_read.elapsed() > plan.stall_timeout {
                log::warn!("cache file seems to have stalled, giving up");
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let len = match file.read(&mut buf[..readsize as usize]).await {
            Ok(len) => len,
            Err(err) => {
                log::debug!("cache file read failed: {err}");
                break;
            }
        };
        if len == 0 {
            break;
        }

        if consumed >= plan.start {
            let chunk = Bytes::copy_from_slice(&buf[..len]);
            if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                // client went away; the cache is not ours to touch
                log::debug!("client disconnected mid-stream");
                return;
            }
        }
        consumed += len as i64;
        last_read = Instant::now();
    }
}

/// Detached writer filling a filedata file from an origin GET body. It is
/// the sole mutator of the file and outlives the request that spawned it;
/// client disconnects never cancel it. Any failure, short body, or server
/// shutdown wipes the cache entry so the next freshness check rebuilds it.
pub fn spawn_cache_worker(
    body: Incoming,
    file: std::fs::File,
    total: i64,
    paths: EntryPaths,
    lock: Arc<CacheLock>,
    activity_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    workers: Arc<AtomicUsize>,
) {
    workers.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        let _count = WorkerCount(workers);
        match cache_body(body, file, total, activity_timeout, shutdown).await {
            Ok(()) => log::debug!("successfully cached {}", paths.filedata.display()),
            Err(err) => {
                log::warn!("caching {} failed: {err}", paths.filedata.display());
                nuke_entry(&paths, &lock).await;
            }
        }
    });
}

struct WorkerCount(Arc<AtomicUsize>);

impl Drop for WorkerCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn cache_body(
    mut body: Incoming,
    mut file: std::fs::File,
    total: i64,
    activity_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut written: i64 = 0;
    while written < total {
        let frame = tokio::select! {
            res = tokio::time::timeout(activity_timeout, body.frame()) => {
                res.map_err(|_| anyhow!("network timeout"))?
            }
            _ = shutdown.changed() => return Err(anyhow!("shutdown while caching")),
        };
        let Some(frame) = frame else {
            return Err(anyhow!("base server closed early at {written} of {total} bytes"));
        };
        let frame = frame.context("network read error")?;
        let Ok(data) = frame.into_data() else {
            continue; // trailers
        };
        let keep = std::cmp::min(data.len() as i64, total - written) as usize;
        // unbuffered writes in fixed chunks; readers polling the file size
        // see each chunk as soon as it lands
        for piece in data[..keep].chunks(TRANSFER_CHUNK) {
            file.write_all(piece).context("cache write failed")?;
        }
        written += keep as i64;
    }
    file.sync_all().context("cache flush failed")?;
    Ok(())
}

pub async fn nuke_entry(paths: &EntryPaths, lock: &Arc<CacheLock>) {
    log::debug!("nuking {} from cache", paths.filedata.display());
    let mut handle = LockHandle::new(Arc::clone(lock));
    match handle.acquire().await {
        Ok(()) => {
            store::remove_entry(paths);
            handle.release();
        }
        Err(err) => log::warn!("couldn't lock cache to remove entry: {err}"),
    }
}
