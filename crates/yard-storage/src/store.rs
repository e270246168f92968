//! Keyed vehicle document store, scoped by `(source_partition, stock_num)`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use yard_core::{StoredVehicle, VehicleRecord};

use crate::{path_slug, write_atomic, PgVehicleStore};

/// Persisted collection of vehicle documents.
///
/// Every operation is scoped to one partition. Writes are committed immediately;
/// there are no transactions spanning calls.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// All documents for `partition`, ordered by stock number.
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>>;

    /// Insert a new document. Fails if `(partition, stock_num)` already exists.
    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle>;

    /// Overwrite the document identified by `stored.record`'s partition and stock number.
    async fn replace(&self, stored: &StoredVehicle) -> Result<()>;

    /// Remove one document; returns whether it existed.
    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool>;
}

/// Open a store from a location string: `postgres://…`, `memory:`, `file://<dir>`
/// or a bare directory path.
pub async fn open_store(location: &str) -> Result<Box<dyn VehicleStore>> {
    let location = location.trim();
    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
        let store = PgVehicleStore::connect(location).await?;
        return Ok(Box::new(store));
    }
    if location == "memory:" {
        return Ok(Box::new(InMemoryVehicleStore::new()));
    }
    let dir = location.strip_prefix("file://").unwrap_or(location);
    if dir.is_empty() {
        bail!("empty store location");
    }
    Ok(Box::new(JsonFileStore::new(dir)))
}

type Key = (String, String);

fn key_of(record: &VehicleRecord) -> Key {
    (record.source_partition.clone(), record.stock_num.clone())
}

/// In-process store for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryVehicleStore {
    docs: RwLock<BTreeMap<Key, StoredVehicle>>,
}

impl InMemoryVehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = VehicleRecord>) -> Self {
        let docs = records
            .into_iter()
            .map(|record| (key_of(&record), StoredVehicle::new(record)))
            .collect();
        Self {
            docs: RwLock::new(docs),
        }
    }

    /// Every document across all partitions.
    pub fn all(&self) -> Vec<StoredVehicle> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VehicleStore for InMemoryVehicleStore {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs
            .iter()
            .filter(|((p, _), _)| p == partition)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(record);
        if docs.contains_key(&key) {
            bail!(
                "duplicate key ({}, {}) in vehicle store",
                record.source_partition,
                record.stock_num
            );
        }
        let stored = StoredVehicle::new(record.clone());
        docs.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(&stored.record);
        match docs.get_mut(&key) {
            Some(doc) => {
                *doc = stored.clone();
                Ok(())
            }
            None => bail!("no document ({}, {}) to replace", key.0, key.1),
        }
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs
            .remove(&(partition.to_string(), stock_num.to_string()))
            .is_some())
    }
}

/// One JSON document per partition under `root`, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        self.root.join(format!("{}.json", path_slug(partition)))
    }

    /// Every document in the file backing `partition`. Distinct partition ids can
    /// share a slug, so the file may hold documents of other partitions too.
    async fn read_file(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        let path = self.partition_path(partition);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_file(&self, partition: &str, docs: &mut [StoredVehicle]) -> Result<()> {
        docs.sort_by(|a, b| key_of(&a.record).cmp(&key_of(&b.record)));
        let path = self.partition_path(partition);
        let bytes = serde_json::to_vec_pretty(docs).context("serializing partition documents")?;
        write_atomic(&path, &bytes).await
    }
}

fn position_of(docs: &[StoredVehicle], partition: &str, stock_num: &str) -> Option<usize> {
    docs.iter()
        .position(|d| d.record.source_partition == partition && d.record.stock_num == stock_num)
}

#[async_trait]
impl VehicleStore for JsonFileStore {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        let mut docs: Vec<_> = self
            .read_file(partition)
            .await?
            .into_iter()
            .filter(|doc| doc.record.source_partition == partition)
            .collect();
        docs.sort_by(|a, b| a.record.stock_num.cmp(&b.record.stock_num));
        Ok(docs)
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        let _guard = self.write_lock.lock().await;
        let partition = record.source_partition.as_str();
        let mut docs = self.read_file(partition).await?;
        if position_of(&docs, partition, &record.stock_num).is_some() {
            bail!(
                "duplicate key ({}, {}) in {}",
                partition,
                record.stock_num,
                self.partition_path(partition).display()
            );
        }
        let stored = StoredVehicle::new(record.clone());
        docs.push(stored.clone());
        self.write_file(partition, &mut docs).await?;
        debug!(partition, stock_num = %record.stock_num, "inserted document");
        Ok(stored)
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let partition = stored.record.source_partition.as_str();
        let mut docs = self.read_file(partition).await?;
        let Some(index) = position_of(&docs, partition, &stored.record.stock_num) else {
            bail!(
                "no document ({}, {}) to replace",
                partition,
                stored.record.stock_num
            );
        };
        docs[index] = stored.clone();
        self.write_file(partition, &mut docs).await
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.read_file(partition).await?;
        let Some(index) = position_of(&docs, partition, stock_num) else {
            return Ok(false);
        };
        docs.remove(index);
        self.write_file(partition, &mut docs).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(partition: &str, stock: &str) -> VehicleRecord {
        VehicleRecord::new(partition, stock, 1984, "300D")
    }

    #[tokio::test]
    async fn in_memory_store_scopes_by_partition() {
        let store = InMemoryVehicleStore::with_records([rec("a", "1"), rec("b", "1")]);
        assert_eq!(store.load_partition("a").await.unwrap().len(), 1);

        assert!(store.delete("a", "1").await.unwrap());
        assert!(!store.delete("a", "1").await.unwrap());
        assert_eq!(store.load_partition("b").await.unwrap().len(), 1);
        assert!(store.insert(&rec("b", "1")).await.is_err());
    }

    #[tokio::test]
    async fn json_file_store_round_trips_and_isolates_partitions() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let first = store.insert(&rec("lkq-dayton", "A")).await.unwrap();
        store.insert(&rec("lkq-dayton", "B")).await.unwrap();
        store.insert(&rec("lkq-cincinnati", "A")).await.unwrap();
        assert!(store.insert(&rec("lkq-dayton", "A")).await.is_err());

        let mut updated = first.clone();
        updated.record.image = Some("https://img.test/a.jpg".into());
        store.replace(&updated).await.unwrap();

        let dayton = store.load_partition("lkq-dayton").await.unwrap();
        assert_eq!(dayton.len(), 2);
        assert_eq!(dayton[0].row_id, first.row_id);
        assert_eq!(dayton[0].record.image.as_deref(), Some("https://img.test/a.jpg"));

        assert!(store.delete("lkq-dayton", "A").await.unwrap());
        assert_eq!(store.load_partition("lkq-dayton").await.unwrap().len(), 1);
        assert_eq!(store.load_partition("lkq-cincinnati").await.unwrap().len(), 1);
        assert!(store.load_partition("never-seen").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_file_store_keeps_partitions_sharing_a_file_apart() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert_eq!(path_slug("lkq-dayton"), path_slug("lkq_dayton"));

        store.insert(&rec("lkq-dayton", "A")).await.unwrap();
        store.insert(&rec("lkq_dayton", "A")).await.unwrap();
        store.insert(&rec("lkq_dayton", "B")).await.unwrap();
        assert!(store.delete("lkq_dayton", "A").await.unwrap());

        let dayton = store.load_partition("lkq-dayton").await.unwrap();
        assert_eq!(dayton.len(), 1);
        assert_eq!(dayton[0].record.stock_num, "A");
        let other = store.load_partition("lkq_dayton").await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].record.stock_num, "B");
    }

    #[tokio::test]
    async fn open_store_picks_backend_from_location() {
        let dir = tempdir().expect("tempdir");
        let location = format!("file://{}", dir.path().display());
        let store = open_store(&location).await.unwrap();
        store.insert(&rec("p", "1")).await.unwrap();
        assert!(dir.path().join("p.json").exists());

        let memory = open_store("memory:").await.unwrap();
        assert!(memory.load_partition("p").await.unwrap().is_empty());
    }
}
