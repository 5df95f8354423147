//! Persisted node/value cache hook.
//!
//! The driver reads a [`NetworkSnapshot`] when the controller reports its
//! Home ID and writes one back at shutdown. Restored nodes skip the
//! protocol, naming and command class stages of the interview.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::node::Node;
use crate::value::Value;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cache encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Cache belongs to home 0x{found:08X}, expected 0x{expected:08X}")]
    HomeMismatch { expected: u32, found: u32 },
}

/// One node and its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: Node,
    #[serde(default)]
    pub values: Vec<Value>,
}

/// Everything the driver persists about a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub home_id: u32,
    pub controller_node_id: u8,
    #[serde(default)]
    pub nodes: Vec<NodeSnapshot>,
}

impl NetworkSnapshot {
    pub fn node(&self, node_id: u8) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|snapshot| snapshot.node.node_id == node_id)
    }
}

/// Load/save hook for the network cache.
pub trait NodeCache: Send {
    /// Cached snapshot for `home_id`, if one exists.
    fn load(&mut self, home_id: u32) -> Result<Option<NetworkSnapshot>, CacheError>;

    fn save(&mut self, snapshot: &NetworkSnapshot) -> Result<(), CacheError>;
}

/// Cache that remembers nothing.
#[derive(Debug, Default)]
pub struct NullCache;

impl NodeCache for NullCache {
    fn load(&mut self, _home_id: u32) -> Result<Option<NetworkSnapshot>, CacheError> {
        Ok(None)
    }

    fn save(&mut self, _snapshot: &NetworkSnapshot) -> Result<(), CacheError> {
        Ok(())
    }
}

/// One TOML file per network, `zwcache_<homeid>.toml`, under a directory.
#[derive(Debug, Clone)]
pub struct TomlFileCache {
    dir: PathBuf,
}

impl TomlFileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, home_id: u32) -> PathBuf {
        self.dir.join(format!("zwcache_{:08x}.toml", home_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl NodeCache for TomlFileCache {
    fn load(&mut self, home_id: u32) -> Result<Option<NetworkSnapshot>, CacheError> {
        let path = self.path_for(home_id);
        if !path.exists() {
            debug!(path = %path.display(), "No cache file");
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let snapshot: NetworkSnapshot = toml::from_str(&content)?;
        if snapshot.home_id != home_id {
            return Err(CacheError::HomeMismatch {
                expected: home_id,
                found: snapshot.home_id,
            });
        }
        info!(path = %path.display(), nodes = snapshot.nodes.len(), "Loaded network cache");
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &NetworkSnapshot) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot.home_id);
        let content = toml::to_string_pretty(snapshot)?;
        std::fs::write(&path, content)?;
        info!(path = %path.display(), nodes = snapshot.nodes.len(), "Saved network cache");
        Ok(())
    }
}
