/// The filesystem backend keeps every document in memory and rewrites a
/// compressed snapshot file after each mutation, so the store survives
/// restarts without an external database.
use super::memory::MemoryBackend;
use super::{BackendError, ConfigBackend, Query};
use crate::document::ConfigDocument;
use crate::predicate::Predicate;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    // zstd with compression level
    Zstd(i32),
}

impl Compression {
    pub fn from_level(level: Option<i32>) -> Self {
        level.map_or(Compression::None, Compression::Zstd)
    }
}

struct Codec {
    compression: Compression,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec { compression }
    }

    fn write<W: Write>(&self, writer: &mut W, documents: &[ConfigDocument]) -> Result<usize, BackendError> {
        let encoded = serde_json::to_vec(documents).map_err(BackendError::Encode)?;
        match self.compression {
            Compression::None => {
                writer.write_all(&encoded)?;
                writer.flush()?;
            }
            Compression::Zstd(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                encoder.write_all(&encoded)?;
                encoder.finish()?.flush()?;
            }
        }
        Ok(encoded.len())
    }

    fn read<R: Read>(&self, reader: R) -> Result<Vec<ConfigDocument>, BackendError> {
        match self.compression {
            Compression::None => serde_json::from_reader(reader).map_err(BackendError::Decode),
            Compression::Zstd(_) => {
                let decoder = zstd::stream::read::Decoder::new(reader)?;
                serde_json::from_reader(decoder).map_err(BackendError::Decode)
            }
        }
    }
}

pub struct FilesystemBackend {
    path: PathBuf,
    codec: Codec,
    documents: MemoryBackend,
    // Serializes mutate-then-persist so snapshots are written in commit order.
    persist_lock: Mutex<()>,
}

impl FilesystemBackend {
    /// Opens the snapshot at `base_dir/filename`, starting empty if the file
    /// does not exist yet.
    pub fn open(base_dir: &str, filename: &str, compression: Compression) -> Result<Self, BackendError> {
        let path = Path::new(base_dir).join(filename);
        let codec = Codec::new(compression);
        let documents = match File::open(&path) {
            Ok(file) => codec.read(io::BufReader::new(file))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), documents = documents.len(), "Loaded config snapshot");

        Ok(FilesystemBackend {
            path,
            codec,
            documents: MemoryBackend::from_documents(documents),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), BackendError> {
        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = io::BufWriter::new(file);
        let size = self.codec.write(&mut writer, &self.documents.snapshot())?;
        drop(writer);
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(path = %self.path.display(), bytes = size, "Stored config snapshot");
        Ok(())
    }

    // A failed snapshot undoes the in-memory insert so memory never runs
    // ahead of disk.
    fn persist_or_rollback(&self, inserted: &[&ConfigDocument]) -> Result<(), BackendError> {
        self.persist().inspect_err(|e| {
            tracing::error!(error = %e, path = %self.path.display(), "Failed to store config snapshot");
            for document in inserted {
                self.documents.remove(&document.key(), document.version);
            }
        })
    }
}

#[async_trait]
impl ConfigBackend for FilesystemBackend {
    async fn find(&self, query: &Query) -> Result<Vec<ConfigDocument>, BackendError> {
        Ok(self.documents.find_sync(query))
    }

    async fn insert(&self, document: ConfigDocument) -> Result<(), BackendError> {
        let _guard = self.persist_lock.lock().await;
        self.documents.insert_sync(document.clone())?;
        self.persist_or_rollback(&[&document])
    }

    async fn insert_if(
        &self,
        document: ConfigDocument,
        condition: &Predicate,
    ) -> Result<bool, BackendError> {
        let _guard = self.persist_lock.lock().await;
        if !self.documents.insert_if_sync(document.clone(), condition) {
            return Ok(false);
        }
        self.persist_or_rollback(&[&document])?;
        Ok(true)
    }

    async fn bulk_insert(
        &self,
        documents: Vec<ConfigDocument>,
    ) -> Result<Vec<Result<(), BackendError>>, BackendError> {
        let _guard = self.persist_lock.lock().await;
        let mut inserted = Vec::new();
        let results: Vec<Result<(), BackendError>> = documents
            .into_iter()
            .map(|d| {
                let result = self.documents.insert_sync(d.clone());
                if result.is_ok() {
                    inserted.push(d);
                }
                result
            })
            .collect();
        if !inserted.is_empty() {
            self.persist_or_rollback(&inserted.iter().collect::<Vec<_>>())?;
        }
        Ok(results)
    }

    async fn health_check(&self) -> bool {
        self.path.parent().is_some_and(Path::is_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SortOrder;
    use crate::document::{CONTEXT_FIELD, key_predicate};
    use crate::types::{ConfigResource, ConfigResourceContext};
    use serde_json::json;

    fn key(context: &str) -> ConfigResourceContext {
        ConfigResource::new("rules", "alerting", "tenant-1").context(context)
    }

    fn documents() -> Vec<ConfigDocument> {
        vec![
            ConfigDocument::new(&key("a"), 1, json!({"x": [1, 2]}), "u1", "u1@example.com", 10, 10),
            ConfigDocument::new(&key("a"), 2, json!(null), "u2", "u2@example.com", 10, 20),
            ConfigDocument::new(&key("b"), 1, json!({"y": "z"}), "u1", "u1@example.com", 30, 30),
        ]
    }

    #[test]
    fn test_codec() {
        for compression in [Compression::None, Compression::Zstd(1), Compression::Zstd(3)] {
            let codec = Codec::new(compression);
            let data = documents();
            let mut buffer: Vec<u8> = Vec::new();
            let size = codec.write(&mut buffer, &data).unwrap();
            assert_eq!(size, serde_json::to_vec(&data).unwrap().len());
            let reader: &[u8] = &buffer;
            assert_eq!(codec.read(reader).unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = dir.path().to_str().unwrap();

        let backend = FilesystemBackend::open(base_dir, "configs.zst", Compression::Zstd(1)).unwrap();
        assert!(backend.documents.is_empty());
        assert!(backend.health_check().await);
        for document in documents() {
            backend.insert(document).await.unwrap();
        }
        assert!(backend.path().exists());
        drop(backend);

        let reopened = FilesystemBackend::open(base_dir, "configs.zst", Compression::Zstd(1)).unwrap();
        let found = reopened
            .find(&Query::default().sort_by(CONTEXT_FIELD, SortOrder::Ascending))
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        let a = reopened.find(&Query::new(key_predicate(&key("a")))).await.unwrap();
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("configs.json"), b"not json").unwrap();
        let result = FilesystemBackend::open(dir.path().to_str().unwrap(), "configs.json", Compression::None);
        assert!(matches!(result, Err(BackendError::Decode(_))));
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = dir.path().join("gone");
        std::fs::create_dir(&base_dir).unwrap();
        let backend =
            FilesystemBackend::open(base_dir.to_str().unwrap(), "configs.json", Compression::None).unwrap();
        std::fs::remove_dir(&base_dir).unwrap();

        let document = documents().remove(0);
        assert!(matches!(backend.insert(document).await, Err(BackendError::Io(_))));
        assert!(backend.documents.is_empty());
        assert!(!backend.health_check().await);
    }
}
