//! In-process vector store persisted to a single vectors.bin file.

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ivf_worth_building, validate_vector, ContentId, EmbeddingRecord, ScoredRecord, StoreError,
    VectorStore,
};
use crate::semantic::{
    model_id_hash, truncate_chars, VectorEntry, VectorIndex, VectorStorage, VectorStorageError,
    STORED_SNIPPET_CHARS,
};

#[derive(Debug, Clone, Copy)]
pub struct IvfSettings {
    pub lists: usize,
    pub probes: usize,
}

impl Default for IvfSettings {
    fn default() -> Self {
        Self {
            lists: 100,
            probes: 1,
        }
    }
}

/// Writers take `writes` for the whole mutate-then-persist step and hold the
/// index write lock only while mutating, so searches run during file writes.
pub struct LocalVectorStore {
    index: RwLock<VectorIndex>,
    writes: tokio::sync::Mutex<()>,
    storage: Option<VectorStorage>,
    model_id: [u8; 32],
    dimensions: usize,
    ivf: IvfSettings,
}

impl LocalVectorStore {
    /// A store that lives only as long as the process.
    #[cfg(test)]
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            index: RwLock::new(VectorIndex::new(dimensions)),
            writes: tokio::sync::Mutex::new(()),
            storage: None,
            model_id: [0u8; 32],
            dimensions,
            ivf: IvfSettings::default(),
        }
    }

    /// A store persisted at `path`. Existing data is loaded by `init`.
    pub fn open(path: PathBuf, model_name: &str, dimensions: usize, ivf: IvfSettings) -> Self {
        Self {
            index: RwLock::new(VectorIndex::new(dimensions)),
            writes: tokio::sync::Mutex::new(()),
            storage: Some(VectorStorage::new(path)),
            model_id: model_id_hash(model_name),
            dimensions,
            ivf,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, VectorIndex>, StoreError> {
        self.index
            .read()
            .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, VectorIndex>, StoreError> {
        self.index
            .write()
            .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))
    }

    fn persist(&self, index: &VectorIndex) -> Result<(), StoreError> {
        if let Some(storage) = &self.storage {
            tokio::task::block_in_place(|| storage.save(index, &self.model_id))?;
        }
        Ok(())
    }

    fn load_existing(&self, storage: &VectorStorage) -> Result<VectorIndex, StoreError> {
        if !storage.exists() {
            log::info!("No existing index at {}, starting fresh", storage.path().display());
            return Ok(VectorIndex::new(self.dimensions));
        }

        match storage.load(&self.model_id, self.dimensions) {
            Ok(index) => {
                log::info!("Loaded {} vectors from {}", index.len(), storage.path().display());
                Ok(index)
            }
            Err(VectorStorageError::ModelMismatch) => {
                log::warn!("Model changed, creating fresh index");
                Ok(VectorIndex::new(self.dimensions))
            }
            Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                log::warn!("Storage version {} unsupported, creating fresh index", file_ver);
                Ok(VectorIndex::new(self.dimensions))
            }
            Err(VectorStorageError::DimensionMismatch { expected, got }) => {
                Err(StoreError::DimensionMismatch { expected, got })
            }
            Err(e) => {
                log::error!("Failed to load vectors: {}", e);
                Err(e.into())
            }
        }
    }
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn init(&self) -> Result<(), StoreError> {
        let _writing = self.writes.lock().await;

        if let Some(storage) = &self.storage {
            if let Some(parent) = storage.path().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(VectorStorageError::from)?;
                }
            }
            let loaded = tokio::task::block_in_place(|| self.load_existing(storage))?;
            *self.write()? = loaded;
        }

        let mut index = self.write()?;
        if !index.has_partitions() && ivf_worth_building(index.len(), self.ivf.lists) {
            index.build_partitions(self.ivf.lists, self.ivf.probes);
            log::info!("Built IVF partitions over {} vectors", index.len());
        }

        Ok(())
    }

    async fn upsert(
        &self,
        content_id: ContentId,
        title: &str,
        snippet: &str,
        vector: Vec<f32>,
    ) -> Result<(), StoreError> {
        validate_vector(&vector, self.dimensions)?;

        let now = Utc::now().timestamp_millis();
        let entry = VectorEntry {
            title: title.to_string(),
            snippet: truncate_chars(snippet, STORED_SNIPPET_CHARS).to_string(),
            embedding: vector,
            created_at: now,
            updated_at: now,
        };

        let _writing = self.writes.lock().await;

        let previous = {
            let mut index = self.write()?;
            let previous = index.get(content_id.get()).cloned();
            index.insert(content_id.get(), entry)?;
            previous
        };

        let persisted = self.persist(&*self.read()?);
        if let Err(e) = persisted {
            // keep memory and disk in step
            let mut index = self.write()?;
            match previous {
                Some(previous) => index.insert(content_id.get(), previous)?,
                None => {
                    index.remove(content_id.get());
                }
            }
            return Err(e);
        }

        Ok(())
    }

    async fn get_vector(&self, content_id: ContentId) -> Result<Option<Vec<f32>>, StoreError> {
        let index = self.read()?;
        Ok(index.get(content_id.get()).map(|entry| entry.embedding.clone()))
    }

    async fn get_record(
        &self,
        content_id: ContentId,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let index = self.read()?;
        Ok(index.get(content_id.get()).map(|entry| EmbeddingRecord {
            content_id,
            title: entry.title.clone(),
            snippet: entry.snippet.clone(),
            embedding: entry.embedding.clone(),
            created_at: timestamp(entry.created_at),
            updated_at: timestamp(entry.updated_at),
        }))
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        exclude: Option<ContentId>,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let index = self.read()?;
        let hits = index.search(query, limit, exclude.map(ContentId::get))?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                index.get(hit.id).map(|entry| ScoredRecord {
                    content_id: ContentId::new(hit.id),
                    title: entry.title.clone(),
                    snippet: entry.snippet.clone(),
                    score: f64::from(hit.score),
                })
            })
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.len() as u64)
    }

    async fn reindex(&self) -> Result<(), StoreError> {
        let _writing = self.writes.lock().await;
        let mut index = self.write()?;
        index.build_partitions(self.ivf.lists, self.ivf.probes);
        log::info!("Rebuilt IVF partitions over {} vectors", index.len());
        Ok(())
    }
}
