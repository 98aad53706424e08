// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk cache for host lookup results
//!
//! One JSON file per lookup command, named by the SHA-256 of the command
//! line. Cache problems are logged and otherwise ignored; a broken cache
//! only costs a fresh lookup.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::Result;
use crate::recipe::OverridesRecipe;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    command: String,
    fetched_at_secs: u64,
    hosts: Vec<String>,
}

/// Host lookup cache rooted at a directory
#[derive(Debug, Clone)]
pub struct HostCache {
    dir: PathBuf,
    ttl: Duration,
}

impl HostCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Cache configured by a recipe's overrides, if caching is enabled
    pub fn from_overrides(overrides: &OverridesRecipe) -> Option<Self> {
        if overrides.host_lookup_cache_disabled || overrides.host_lookup_cache_secs == 0 {
            return None;
        }
        let dir = default_cache_dir()?;
        Some(Self::new(
            dir,
            Duration::from_secs(overrides.host_lookup_cache_secs),
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, command: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(command.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    /// Cached hosts for `command`, if present and still fresh
    pub fn load(&self, command: &str) -> Option<Vec<String>> {
        let path = self.entry_path(command);
        let contents = std::fs::read_to_string(&path).ok()?;

        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable host cache entry");
                return None;
            }
        };

        if entry.command != command {
            return None;
        }

        let age = now_secs().saturating_sub(entry.fetched_at_secs);
        if age >= self.ttl.as_secs() {
            debug!(command = %command, age_secs = age, "Host cache entry expired");
            return None;
        }

        Some(entry.hosts)
    }

    /// Record a fresh lookup result
    pub fn store(&self, command: &str, hosts: &[String]) {
        let entry = CacheEntry {
            command: command.to_string(),
            fetched_at_secs: now_secs(),
            hosts: hosts.to_vec(),
        };

        if let Err(e) = self.write_entry(&entry) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to write host cache");
        }
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(entry)?;
        std::fs::write(self.entry_path(&entry.command), json)?;
        Ok(())
    }
}

/// `$XDG_CACHE_HOME/kea-flock`, falling back to `$HOME/.cache/kea-flock`
pub fn default_cache_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))?;
    Some(base.join("kea-flock"))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
