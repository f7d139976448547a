//! Persisted list of connected orchestrators (`client.json`)
//!
//! ```json
//! {"connections": [{"ip": "10.0.0.1", "port": 41000}]}
//! ```
//!
//! The file is rewritten in full on every add and remove.

use crate::error::{lock_poisoned, Result};
use crate::protocol::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistryDoc {
    pub connections: Vec<ConnectionRecord>,
}

pub struct ClientRegistryFile {
    path: PathBuf,
    entries: Mutex<BTreeMap<ClientId, ConnectionRecord>>,
}

impl ClientRegistryFile {
    /// Start with an empty registry at `path`
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self {
            path: path.into(),
            entries: Mutex::new(BTreeMap::new()),
        };
        registry.write(&BTreeMap::new())?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(path: &Path) -> Result<ClientRegistryDoc> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, entries: &BTreeMap<ClientId, ConnectionRecord>) -> Result<()> {
        let doc = ClientRegistryDoc {
            connections: entries.values().cloned().collect(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), connections = doc.connections.len(), "Client registry written");
        Ok(())
    }

    pub fn add(&self, client_id: ClientId, peer: SocketAddr) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_poisoned("client registry"))?;
        entries.insert(
            client_id,
            ConnectionRecord {
                ip: peer.ip().to_string(),
                port: peer.port(),
            },
        );
        self.write(&entries)
    }

    pub fn remove(&self, client_id: ClientId) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_poisoned("client registry"))?;
        if entries.remove(&client_id).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_tracks_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let registry = ClientRegistryFile::create(&path).unwrap();
        assert!(ClientRegistryFile::load(&path).unwrap().connections.is_empty());

        registry.add(1, "10.0.0.1:4000".parse().unwrap()).unwrap();
        registry.add(2, "10.0.0.2:4001".parse().unwrap()).unwrap();
        let doc = ClientRegistryFile::load(&path).unwrap();
        assert_eq!(doc.connections.len(), 2);
        assert_eq!(
            doc.connections[0],
            ConnectionRecord {
                ip: "10.0.0.1".into(),
                port: 4000
            }
        );

        registry.remove(1).unwrap();
        let doc = ClientRegistryFile::load(&path).unwrap();
        assert_eq!(doc.connections.len(), 1);
        assert_eq!(doc.connections[0].port, 4001);
    }
}
