//! Single-slot artifact persistence + HTTP fetch utilities for the word-of-the-day pipeline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use wotd_core::{CacheRecord, PipelineError};

pub const CRATE_NAME: &str = "wotd-storage";

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing cache record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

/// Durable home of the single most recent [`CacheRecord`].
///
/// `put` replaces artifact and fetch time together; no reader may ever observe
/// one without the other.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get_latest(&self) -> Result<Option<CacheRecord>, StoreError>;
    async fn put(&self, record: &CacheRecord) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    schema_version: u32,
    sha256: String,
    record: CacheRecord,
}

/// JSON file store. Writes land in a temp file next to the target and are
/// renamed into place.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    path: PathBuf,
}

impl FileArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Prefix shared by every temp file this store writes next to its target.
    fn temp_prefix(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(".{name}.")
    }

    /// Remove temp files left by writes that never reached the rename, e.g. a
    /// task aborted mid-`put`. Assumes one writer per path.
    async fn sweep_stale_temps(&self, dir: &Path) {
        let prefix = self.temp_prefix();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cannot list cache directory");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".tmp") {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!(temp = %name, "removed stale temp file"),
                    Err(err) => warn!(temp = %name, error = %err, "stale temp file left behind"),
                }
            }
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn decode(&self, data: &str) -> Result<CacheRecord, StoreError> {
        let envelope: StoredEnvelope =
            serde_json::from_str(data).map_err(|err| self.corrupt(err.to_string()))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(self.corrupt(format!(
                "unsupported schema version {}",
                envelope.schema_version
            )));
        }
        let digest = sha256_hex(&serde_json::to_vec(&envelope.record)?);
        if digest != envelope.sha256 {
            return Err(self.corrupt("checksum mismatch"));
        }
        Ok(envelope.record)
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn get_latest(&self) -> Result<Option<CacheRecord>, StoreError> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        self.decode(&data).map(Some)
    }

    async fn put(&self, record: &CacheRecord) -> Result<(), StoreError> {
        let envelope = StoredEnvelope {
            schema_version: SCHEMA_VERSION,
            sha256: sha256_hex(&serde_json::to_vec(record)?),
            record: record.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let dir = self.parent_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;

        let temp_path = dir.join(format!("{}{}.tmp", self.temp_prefix(), Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        self.sweep_stale_temps(&dir).await;

        debug!(
            path = %self.path.display(),
            external_id = record.artifact.external_id(),
            fetched_at = %record.fetched_at,
            "cache record replaced"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&self.path, err)),
        }
    }
}

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    slot: RwLock<Option<CacheRecord>>,
    writes: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CacheRecord) -> Self {
        Self {
            slot: RwLock::new(Some(record)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful `put` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get_latest(&self) -> Result<Option<CacheRecord>, StoreError> {
        Ok(self.slot.read().await.clone())
    }

    async fn put(&self, record: &CacheRecord) -> Result<(), StoreError> {
        *self.slot.write().await = Some(record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.slot.write().await = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::Network(err.to_string())
    }
}

/// Single-attempt HTTP GET. Retrying is the caller's business.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            // Strip the query so credentials never reach the logs.
            let mut final_url = resp.url().clone();
            final_url.set_query(None);
            let final_url = final_url.to_string();

            if !status.is_success() {
                warn!(status = status.as_u16(), url = %final_url, "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;
    use wotd_core::{Artifact, Definition};

    fn record(id: &str, fetched_at: &str) -> CacheRecord {
        let artifact = Artifact::new(
            id,
            "quidnunc",
            "KWID-nungk",
            Definition {
                source: "century".into(),
                text: "One who is curious to know everything that passes.".into(),
                note: None,
                part_of_speech: "noun".into(),
            },
            Vec::new(),
            "2024-01-01T03:00:00.000Z",
            "Latin, literally 'what now?'",
        );
        let fetched_at = DateTime::parse_from_rfc3339(fetched_at)
            .expect("ts")
            .with_timezone(&Utc);
        CacheRecord::new(artifact, fetched_at)
    }

    #[test]
    fn record_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_slot() {
        let dir = tempdir().expect("tempdir");
        let store = FileArtifactStore::new(dir.path().join("wotd.json"));
        assert_eq!(store.get_latest().await.expect("read"), None);
        store.clear().await.expect("clearing a missing file is fine");
    }

    #[tokio::test]
    async fn put_replaces_the_single_slot_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileArtifactStore::new(dir.path().join("nested/wotd.json"));

        let first = record("wod-1", "2024-01-01T02:00:00Z");
        let second = record("wod-2", "2024-01-02T02:00:00Z");
        store.put(&first).await.expect("first put");
        store.put(&second).await.expect("second put");

        assert_eq!(store.get_latest().await.expect("read"), Some(second));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files must be renamed away");
    }

    #[tokio::test]
    async fn put_sweeps_temp_files_from_interrupted_writes() {
        let dir = tempdir().expect("tempdir");
        let store = FileArtifactStore::new(dir.path().join("wotd.json"));
        let orphan = dir.path().join(format!(".wotd.json.{}.tmp", Uuid::new_v4()));
        let unrelated = dir.path().join(".other.json.1234.tmp");
        std::fs::write(&orphan, "{ half written").expect("write orphan");
        std::fs::write(&unrelated, "not ours").expect("write unrelated");

        let saved = record("wod-3", "2024-01-03T02:00:00Z");
        store.put(&saved).await.expect("put");

        assert!(!orphan.exists());
        assert!(unrelated.exists());
        assert_eq!(store.get_latest().await.expect("read"), Some(saved));
    }

    #[tokio::test]
    async fn record_survives_a_new_store_instance() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wotd.json");
        let saved = record("wod-7", "2024-01-01T02:00:00Z");
        FileArtifactStore::new(&path).put(&saved).await.expect("put");

        let reopened = FileArtifactStore::new(&path);
        assert_eq!(reopened.get_latest().await.expect("read"), Some(saved));
    }

    #[tokio::test]
    async fn tampered_record_is_reported_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wotd.json");
        let store = FileArtifactStore::new(&path);
        store
            .put(&record("wod-1", "2024-01-01T02:00:00Z"))
            .await
            .expect("put");

        let data = std::fs::read_to_string(&path).expect("read");
        std::fs::write(&path, data.replace("quidnunc", "quidnuncs")).expect("write");
        assert!(matches!(
            store.get_latest().await,
            Err(StoreError::Corrupt { .. })
        ));

        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            store.get_latest().await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn clear_removes_the_record() {
        let dir = tempdir().expect("tempdir");
        let store = FileArtifactStore::new(dir.path().join("wotd.json"));
        store
            .put(&record("wod-1", "2024-01-01T02:00:00Z"))
            .await
            .expect("put");
        store.clear().await.expect("clear");
        assert_eq!(store.get_latest().await.expect("read"), None);
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryArtifactStore::new();
        store
            .put(&record("wod-1", "2024-01-01T02:00:00Z"))
            .await
            .expect("put");
        store.clear().await.expect("clear");
        assert_eq!(store.writes(), 1);
        assert_eq!(store.get_latest().await.expect("read"), None);
    }

    #[test]
    fn store_errors_map_to_storage_failures() {
        let err = StoreError::Corrupt {
            path: PathBuf::from("wotd.json"),
            reason: "checksum mismatch".into(),
        };
        assert!(matches!(PipelineError::from(err), PipelineError::Storage(_)));
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://api.wordnik.com/v4/words.json/wordOfTheDay".into(),
        };
        assert!(PipelineError::from(err).is_retryable());
    }
}
