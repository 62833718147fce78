use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub access_log: Option<AccessLog>,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.origin.host.trim().is_empty() {
            return Err(anyhow!("origin.host is required"));
        }
        if self.cache.dir.trim().is_empty() {
            return Err(anyhow!("cache.dir is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Origin {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

impl Origin {
    pub fn port(&self) -> u16 {
        if self.port == 0 {
            80
        } else {
            self.port
        }
    }

    /// Activity deadline for all origin traffic and for readers waiting on
    /// a stalled cache writer.
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            Duration::from_secs(90)
        } else {
            self.timeout
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Cache {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub max_dupe_downloads: u32,
}

impl Cache {
    /// Scopes the cross-process lock and the duplicate-download table, so
    /// two instances caching different origins never share either.
    pub fn name(&self) -> &str {
        if self.name.trim().is_empty() {
            "offload"
        } else {
            self.name.trim()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
