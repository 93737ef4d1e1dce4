//! Local contact directory
//!
//! A persisted map from public key (hex) to relation. Every write replaces
//! the whole entry, so the last write wins, and the file is rewritten
//! through a temporary file and a rename.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::identity::parse_public_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Following,
    Blocked,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relation::Following => write!(f, "following"),
            Relation::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub relation: Relation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Unix seconds of the last write
    pub updated_at: u64,
}

pub struct PeerDirectory {
    path: PathBuf,
    entries: BTreeMap<String, ContactEntry>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn normalize(key: &str) -> Result<String> {
    Ok(parse_public_key(key)?.to_hex())
}

impl PeerDirectory {
    /// Open the directory at `path`; a missing file is an empty directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read directory file")?;
            serde_json::from_str(&content).context("Failed to parse directory file")?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn follow(&mut self, key: &str, alias: Option<String>) -> Result<()> {
        self.put(key, Relation::Following, alias)
    }

    pub fn block(&mut self, key: &str) -> Result<()> {
        self.put(key, Relation::Blocked, None)
    }

    /// Remove a follow. Blocks are left in place. Returns whether anything changed.
    pub fn unfollow(&mut self, key: &str) -> Result<bool> {
        let key = normalize(key)?;
        match self.entries.get(&key) {
            Some(entry) if entry.relation == Relation::Following => {
                self.entries.remove(&key);
                self.save()?;
                debug!("Unfollowed {}", key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContactEntry> {
        let key = normalize(key).ok()?;
        self.entries.get(&key)
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.get(key).is_some_and(|e| e.relation == Relation::Blocked)
    }

    pub fn is_following(&self, key: &str) -> bool {
        self.get(key).is_some_and(|e| e.relation == Relation::Following)
    }

    /// All entries, ordered by key
    pub fn list(&self) -> impl Iterator<Item = (&str, &ContactEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn put(&mut self, key: &str, relation: Relation, alias: Option<String>) -> Result<()> {
        let key = normalize(key)?;
        debug!("Directory {} -> {}", key, relation);
        self.entries.insert(
            key,
            ContactEntry {
                relation,
                alias,
                updated_at: now_secs(),
            },
        );
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).context("Failed to write directory file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace directory file")?;
        Ok(())
    }
}
