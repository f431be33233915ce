use crate::coordinator::ServerRecord;
use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Persistence boundary for server records.
///
/// The coordinator reads every record once at startup and writes the full
/// record back after each mutation.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn load_all(&self) -> AppResult<Vec<ServerRecord>>;
    async fn save(&self, record: &ServerRecord) -> AppResult<()>;
}

/// Servers file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

/// `servers.toml` in the config directory
pub struct TomlServerStore {
    config_path: PathBuf,
    records: RwLock<BTreeMap<String, ServerRecord>>,
}

impl TomlServerStore {
    pub fn open(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("servers.toml");
        let records = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ServersFile = toml::from_str(&content)?;
            file.servers.into_iter().map(|s| (s.id.clone(), s)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            config_path,
            records: RwLock::new(records),
        })
    }

    fn write_file(&self) -> AppResult<()> {
        let servers: Vec<_> = self.records.read().values().cloned().collect();
        let content = toml::to_string_pretty(&ServersFile { servers })?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }
}

#[async_trait]
impl ServerStore for TomlServerStore {
    async fn load_all(&self) -> AppResult<Vec<ServerRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn save(&self, record: &ServerRecord) -> AppResult<()> {
        self.records.write().insert(record.id.clone(), record.clone());
        self.write_file()
    }
}

/// Non-persistent store, used by tests and one-off runs
#[derive(Default)]
pub struct MemoryServerStore {
    records: RwLock<BTreeMap<String, ServerRecord>>,
    saves: AtomicUsize,
}

impl MemoryServerStore {
    pub fn new(records: Vec<ServerRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, id: &str) -> Option<ServerRecord> {
        self.records.read().get(id).cloned()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn load_all(&self) -> AppResult<Vec<ServerRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn save(&self, record: &ServerRecord) -> AppResult<()> {
        self.records.write().insert(record.id.clone(), record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toml_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlServerStore::open(dir.path()).unwrap();
        let mut record = ServerRecord::new("gpu-1", "10.1.2.3", "ubuntu").with_key("/home/me/.ssh/id_rsa");
        record.deployed = true;
        store.save(&record).await.unwrap();

        let reopened = TomlServerStore::open(dir.path()).unwrap();
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], record);
    }

    #[tokio::test]
    async fn test_minimal_entry_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("servers.toml"),
            "[[servers]]\nid = \"a\"\nhost = \"h\"\nusername = \"u\"\npassword = \"p\"\n",
        )
        .unwrap();
        let store = TomlServerStore::open(dir.path()).unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all[0].port, 22);
        assert_eq!(all[0].llm_port, 11434);
        assert_eq!(all[0].deploy_path, "/opt/llm");
        assert!(!all[0].deployed);
    }
}
