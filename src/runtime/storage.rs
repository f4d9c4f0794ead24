//! Storage port for hibernate/thaw, plus config file helpers
//!
//! Agents are frozen as JSON records. [`FileStorage`] keeps one file per
//! agent under `<root>/<entity_kind>/`, named by the blake3 hash of the
//! agent id, and writes every file atomically via a temp file and rename.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::agent::AgentState;
use super::error::{StorageError, StorageResult};
use super::manager::ManagerConfig;

/// Persistence port: `thaw` recovers a frozen agent, `freeze` stores one
pub trait Storage: Send + Sync {
    /// Load the agent stored for `(entity_kind, id)`, if any
    fn thaw(&self, entity_kind: &str, id: &str) -> StorageResult<Option<AgentState>>;

    /// Store the agent under `(entity_kind, id)`, replacing any previous record
    fn freeze(&self, entity_kind: &str, id: &str, agent: &AgentState) -> StorageResult<()>;

    /// Remove a stored agent; returns whether one existed
    fn delete(&self, entity_kind: &str, id: &str) -> StorageResult<bool>;

    /// Ids stored under `entity_kind`, sorted
    fn list(&self, entity_kind: &str) -> StorageResult<Vec<String>>;
}

/// Storage bound to one entity kind, as carried by a worker
#[derive(Clone)]
pub struct Persistence {
    /// Backing store
    pub storage: Arc<dyn Storage>,
    /// Namespace inside the store
    pub entity_kind: String,
}

impl Persistence {
    /// Bind `storage` to `entity_kind`
    pub fn new(storage: Arc<dyn Storage>, entity_kind: impl Into<String>) -> Self {
        Self {
            storage,
            entity_kind: entity_kind.into(),
        }
    }
}

/// Which storage adapter a manager uses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum StorageConfig {
    /// No hibernation; stopped agents are discarded
    #[default]
    None,
    /// Process-local map
    Memory,
    /// JSON files under `root`
    File {
        /// Root directory
        root: PathBuf,
    },
}

impl StorageConfig {
    /// Open the configured adapter
    pub fn open(&self) -> StorageResult<Option<Arc<dyn Storage>>> {
        Ok(match self {
            StorageConfig::None => None,
            StorageConfig::Memory => Some(Arc::new(MemoryStorage::new())),
            StorageConfig::File { root } => Some(Arc::new(FileStorage::open(root)?)),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    id: String,
    agent: AgentState,
}

// ========== Memory ==========

/// In-memory storage for tests and single-process use
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn thaw(&self, entity_kind: &str, id: &str) -> StorageResult<Option<AgentState>> {
        let records = self.records.read();
        let Some(encoded) = records.get(&(entity_kind.to_string(), id.to_string())) else {
            return Ok(None);
        };
        let record: Record = serde_json::from_str(encoded).map_err(|err| StorageError::Corrupt {
            id: id.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Some(record.agent))
    }

    fn freeze(&self, entity_kind: &str, id: &str, agent: &AgentState) -> StorageResult<()> {
        // encode so thawed agents never alias live ones
        let encoded = serde_json::to_string(&Record {
            id: id.to_string(),
            agent: agent.clone(),
        })?;
        self.records
            .write()
            .insert((entity_kind.to_string(), id.to_string()), encoded);
        Ok(())
    }

    fn delete(&self, entity_kind: &str, id: &str) -> StorageResult<bool> {
        Ok(self
            .records
            .write()
            .remove(&(entity_kind.to_string(), id.to_string()))
            .is_some())
    }

    fn list(&self, entity_kind: &str) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|(kind, _)| kind == entity_kind)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ========== Files ==========

/// One JSON file per agent
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Use `root`, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, entity_kind: &str) -> PathBuf {
        self.root.join(entity_kind)
    }

    /// File holding `(entity_kind, id)`
    pub fn record_path(&self, entity_kind: &str, id: &str) -> PathBuf {
        let name = blake3::hash(id.as_bytes()).to_hex();
        self.kind_dir(entity_kind).join(format!("{name}.json"))
    }

    fn read_record(path: &Path, id_hint: &str) -> StorageResult<Record> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|err| StorageError::Corrupt {
            id: id_hint.to_string(),
            detail: err.to_string(),
        })
    }
}

impl Storage for FileStorage {
    fn thaw(&self, entity_kind: &str, id: &str) -> StorageResult<Option<AgentState>> {
        let path = self.record_path(entity_kind, id);
        if !path.exists() {
            return Ok(None);
        }
        let record = Self::read_record(&path, id)?;
        if record.id != id {
            return Err(StorageError::Corrupt {
                id: id.to_string(),
                detail: format!("file holds agent '{}'", record.id),
            });
        }
        Ok(Some(record.agent))
    }

    fn freeze(&self, entity_kind: &str, id: &str, agent: &AgentState) -> StorageResult<()> {
        fs::create_dir_all(self.kind_dir(entity_kind))?;
        let data = serde_json::to_vec_pretty(&Record {
            id: id.to_string(),
            agent: agent.clone(),
        })?;
        write_atomic(&self.record_path(entity_kind, id), &data)
    }

    fn delete(&self, entity_kind: &str, id: &str) -> StorageResult<bool> {
        let path = self.record_path(entity_kind, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, entity_kind: &str) -> StorageResult<Vec<String>> {
        let dir = self.kind_dir(entity_kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let hint = path.display().to_string();
            ids.push(Self::read_record(&path, &hint)?.id);
        }
        ids.sort();
        Ok(ids)
    }
}

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames and
/// syncs the parent directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let failed = |detail: String| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail,
    };
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .map_err(|err| failed(format!("create {}: {err}", temp_path.display())))?;
    file.write_all(data)
        .map_err(|err| failed(format!("write: {err}")))?;
    file.sync_all()
        .map_err(|err| failed(format!("sync: {err}")))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|err| failed(format!("rename from {}: {err}", temp_path.display())))?;

    if let Some(parent) = path.parent() {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .map_err(|err| failed(format!("open directory: {err}")))?;
        dir.sync_all()
            .map_err(|err| failed(format!("sync directory: {err}")))?;
    }
    Ok(())
}

// ========== Config files ==========

/// Write a manager config as JSON
pub fn write_config(path: &Path, config: &ManagerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json).with_context(|| format!("Failed to write config: {:?}", path))?;
    Ok(())
}

/// Load a manager config written by [`write_config`]
pub fn load_config(path: &Path) -> Result<ManagerConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read config: {:?}", path))?;
    let config = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse config: {:?}", path))?;
    Ok(config)
}
