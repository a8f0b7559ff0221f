//! Storage configuration.
//!
//! Selects the storage engine and its durability trade-offs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default store file name, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = "driftq.log";

/// Which storage engine backs a queue manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Append-only log file (durable).
    #[default]
    Log,
    /// Process memory (lost on exit).
    Memory,
}

/// When writes reach the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// `fsync` after every mutation before returning.
    #[default]
    Full,
    /// Leave flushing to the OS. A crash may lose recent mutations.
    Buffered,
}

/// Configuration for a queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the store file (ignored by the memory backend).
    /// Default: `driftq.log`
    pub path: PathBuf,

    /// Default: `log`
    pub backend: StorageBackend,

    /// Default: `full`
    pub durability: Durability,

    /// Rewrite the store holding only live records when it is opened.
    /// Default: true
    pub compact_on_open: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORE_PATH),
            backend: StorageBackend::Log,
            durability: Durability::Full,
            compact_on_open: true,
        }
    }
}

impl StorageConfig {
    /// Log-backed store at `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// In-memory store.
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_compact_on_open(mut self, compact: bool) -> Self {
        self.compact_on_open = compact;
        self
    }
}
