//! Last-known state of every applied resource.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::graph::{LogicalId, ResourceKind};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("state file version {found} is not supported (expected {STATE_VERSION})")]
    UnsupportedVersion { found: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub kind: ResourceKind,
    /// Properties as declared, intrinsics unresolved.
    pub declared: Value,
    #[serde(default)]
    pub depends_on: Vec<LogicalId>,
    /// Attributes reported by the provider, `Ref` included.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Where applied state lives between runs.
pub trait StateStore: Send + Sync {
    fn read(&self, id: &str) -> Result<Option<ResourceState>, StateError>;
    fn write(&mut self, id: &LogicalId, state: ResourceState) -> Result<(), StateError>;
    fn remove(&mut self, id: &str) -> Result<Option<ResourceState>, StateError>;
    fn all(&self) -> Result<BTreeMap<LogicalId, ResourceState>, StateError>;

    fn ids(&self) -> Result<Vec<LogicalId>, StateError> {
        Ok(self.all()?.into_keys().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    resources: BTreeMap<LogicalId, ResourceState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self, id: &str) -> Result<Option<ResourceState>, StateError> {
        Ok(self.resources.get(id).cloned())
    }

    fn write(&mut self, id: &LogicalId, state: ResourceState) -> Result<(), StateError> {
        self.resources.insert(id.clone(), state);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<Option<ResourceState>, StateError> {
        Ok(self.resources.remove(id))
    }

    fn all(&self) -> Result<BTreeMap<LogicalId, ResourceState>, StateError> {
        Ok(self.resources.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    resources: BTreeMap<LogicalId, ResourceState>,
}

/// JSON file, rewritten in full after every change.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    resources: BTreeMap<LogicalId, ResourceState>,
}

impl FileStateStore {
    /// Open the state at `path`. A missing file is an empty state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let resources = match fs::read_to_string(&path) {
            Ok(content) => {
                let file: StateFile =
                    serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                if file.version != STATE_VERSION {
                    return Err(StateError::UnsupportedVersion { found: file.version });
                }
                file.resources
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StateError::Io { path, source }),
        };
        debug!(path = %path.display(), resources = resources.len(), "opened state");
        Ok(Self { path, resources })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = StateFile {
            version: STATE_VERSION,
            resources: self.resources.clone(),
        };
        let body = serde_json::to_string_pretty(&file).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        // write then rename, so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn read(&self, id: &str) -> Result<Option<ResourceState>, StateError> {
        Ok(self.resources.get(id).cloned())
    }

    fn write(&mut self, id: &LogicalId, state: ResourceState) -> Result<(), StateError> {
        self.resources.insert(id.clone(), state);
        self.persist()
    }

    fn remove(&mut self, id: &str) -> Result<Option<ResourceState>, StateError> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    fn all(&self) -> Result<BTreeMap<LogicalId, ResourceState>, StateError> {
        Ok(self.resources.clone())
    }
}
