//! Network record persistence.
//!
//! One JSON file per network, named by the network ID.

use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthResult};

use crate::model::Network;

/// Persists network records to a directory.
#[derive(Debug, Clone)]
pub struct NetworkStore {
    /// Directory holding the records.
    dir: PathBuf,
}

impl NetworkStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> BerthResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory backing this store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a network's record.
    #[must_use]
    pub fn record_path(&self, network_id: &str) -> PathBuf {
        self.dir.join(network_id)
    }

    /// Save a network record.
    ///
    /// The record is written to a hidden temporary file first and renamed
    /// into place, so a crash never leaves a truncated record behind.
    pub fn save(&self, network: &Network) -> BerthResult<()> {
        let path = self.record_path(&network.id);
        let tmp = self.dir.join(format!(".{}.tmp", network.id));

        let json = serde_json::to_vec_pretty(network)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            network_id = %network.id,
            path = %path.display(),
            "Saved network record"
        );

        Ok(())
    }

    /// Load a network record.
    pub fn load(&self, network_id: &str) -> BerthResult<Network> {
        let path = self.record_path(network_id);

        if !path.exists() {
            return Err(BerthError::NetworkNotFound {
                name: network_id.to_string(),
            });
        }

        let json = std::fs::read(&path)?;
        let network: Network = serde_json::from_slice(&json).map_err(|e| {
            BerthError::Serialization(format!("network record {network_id}: {e}"))
        })?;

        Ok(network)
    }

    /// Delete a network record. A record that is already gone is not an error.
    pub fn remove(&self, network_id: &str) -> BerthResult<()> {
        let path = self.record_path(network_id);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(
                    network_id = %network_id,
                    path = %path.display(),
                    "Deleted network record"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// IDs of all persisted records, sorted.
    ///
    /// Hidden files (including interrupted temporary writes) are skipped.
    pub fn list(&self) -> BerthResult<Vec<String>> {
        let mut ids = Vec::new();

        if !self.dir.exists() {
            return Ok(ids);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Check if a record exists.
    #[must_use]
    pub fn exists(&self, network_id: &str) -> bool {
        self.record_path(network_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_record() {
        let temp = tempdir().unwrap();
        let store = NetworkStore::open(temp.path()).unwrap();

        let mut network = Network::new("backend", "bridge", Labels::new());
        network.state.insert("bridge".into(), r#"{"x":1}"#.into());
        store.save(&network).unwrap();

        let loaded = store.load(&network.id).unwrap();
        assert_eq!(loaded, network);
    }

    #[test]
    fn list_skips_hidden_files() {
        let temp = tempdir().unwrap();
        let store = NetworkStore::open(temp.path()).unwrap();

        let a = Network::new("a", "bridge", Labels::new());
        let b = Network::new("b", "bridge", Labels::new());
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        std::fs::write(temp.path().join(".stale.tmp"), b"{").unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    #[test]
    fn remove_record_twice() {
        let temp = tempdir().unwrap();
        let store = NetworkStore::open(temp.path()).unwrap();

        let network = Network::new("a", "bridge", Labels::new());
        store.save(&network).unwrap();
        assert!(store.exists(&network.id));

        store.remove(&network.id).unwrap();
        assert!(!store.exists(&network.id));
        store.remove(&network.id).unwrap();
    }

    #[test]
    fn corrupt_record_fails_to_load() {
        let temp = tempdir().unwrap();
        let store = NetworkStore::open(temp.path()).unwrap();
        std::fs::write(temp.path().join("deadbeef"), b"not json").unwrap();

        let err = store.load("deadbeef").unwrap_err();
        assert!(matches!(err, BerthError::Serialization(_)));
    }
}
