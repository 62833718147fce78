use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::headers::HeaderList;

/// Content-addressed cache layout: one `metadata-<key>` / `filedata-<key>`
/// pair per origin ETag under the cache directory.
pub struct CacheStore {
    dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EntryPaths {
    pub metadata: PathBuf,
    pub filedata: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn entry_paths(&self, key: &str) -> EntryPaths {
        EntryPaths {
            metadata: self.dir.join(format!("metadata-{key}")),
            filedata: self.dir.join(format!("filedata-{key}")),
        }
    }
}

/// Strips the weak-validator prefix. The stored `ETag` and the response
/// `ETag` both use this strong form; the untouched original is kept in
/// `X-Offload-Orig-ETag`.
pub fn normalize_etag(raw: &str) -> (&str, bool) {
    if raw.len() > 2 && raw.as_bytes()[..2].eq_ignore_ascii_case(b"W/") {
        (&raw[2..], true)
    } else {
        (raw, false)
    }
}

const TRIM_CHARS: [char; 5] = [' ', '\t', '\x0B', '"', '\''];

/// Filesystem-safe key for a normalized ETag: quote/space trimming at both
/// ends, then a deterministic %XX escape of anything not [A-Za-z0-9._-].
/// An ETag that trims to nothing cannot address a cache entry.
pub fn cache_key(normalized_etag: &str) -> Option<String> {
    let trimmed = normalized_etag.trim_matches(&TRIM_CHARS[..]);
    if trimmed.is_empty() {
        return None;
    }
    let mut key = String::with_capacity(trimmed.len());
    for byte in trimmed.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                key.push(byte as char)
            }
            _ => key.push_str(&format!("%{byte:02X}")),
        }
    }
    Some(key)
}

/// Alternating key/value lines. An incomplete trailing pair is dropped and
/// an empty key line ends the file.
pub fn load_metadata(path: &Path) -> Option<HeaderList> {
    let raw = fs::read_to_string(path).ok()?;
    let mut list = HeaderList::new();
    let mut lines = raw.split('\n');
    while let (Some(key), Some(value)) = (lines.next(), lines.next()) {
        if key.is_empty() {
            break;
        }
        list.set(key, value);
        log::debug!("loaded metadata '{key}' => '{value}'");
    }
    Some(list)
}

pub fn write_metadata(path: &Path, headers: &HeaderList) -> Result<()> {
    let mut out = String::new();
    for (key, value) in headers.iter() {
        out.push_str(key);
        out.push('\n');
        out.push_str(value);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("write metadata {}", path.display()))?;
    Ok(())
}

pub fn remove_entry(paths: &EntryPaths) {
    let _ = fs::remove_file(&paths.metadata);
    let _ = fs::remove_file(&paths.filedata);
}

pub fn parse_len(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

/// Decides whether a cached entry still represents the origin object
/// described by a fresh HEAD. A filedata file shorter than Content-Length
/// is fine while its caching process is alive; once that process is gone
/// the entry is a dead partial and must be rebuilt.
pub fn entry_fresh(metadata: &HeaderList, head: &HeaderList, filedata: &Path) -> bool {
    let Some(contentlength) = metadata.get("Content-Length") else {
        return false;
    };
    let Some(etag) = metadata.get("ETag") else {
        return false;
    };
    let Some(lastmodified) = metadata.get("Last-Modified") else {
        return false;
    };

    if head.get("Content-Length") != Some(contentlength) {
        return false;
    }
    if head.get("ETag") != Some(etag) {
        return false;
    }
    if head.get("Last-Modified") != Some(lastmodified)
        && metadata.get("X-Offload-Is-Weak") != Some("1")
    {
        return false;
    }

    let Ok(stat) = fs::metadata(filedata) else {
        return false;
    };
    if stat.len() as i64 != parse_len(contentlength) {
        // someone was supposed to be caching this
        let Some(pid) = metadata
            .get("X-Offload-Caching-PID")
            .and_then(|raw| raw.trim().parse::<u32>().ok())
        else {
            return false;
        };
        if !crate::dupes::process_alive(pid) {
            log::debug!("caching process {pid} died, entry is abandoned");
            return false;
        }
    }
    true
}
