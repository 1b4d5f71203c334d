//! Conversation memory: transcripts on disk, lazily indexed into one of two
//! interchangeable backends and searchable by similarity.

mod chunker;
mod embedding;
mod external;
mod ledger;
mod local;
mod transcript;
mod vector_store;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{EmbeddingMode, RetrieverConfig};
use crate::error::MemoryResult;

pub(crate) use chunker::{CHUNK_OVERLAP, CHUNK_SIZE, chunk_text};
pub(crate) use embedding::{EmbeddingProvider, HashEmbedder, LOCAL_MODEL_NAME, ProviderLoader};
pub(crate) use external::ExternalBackend;
pub(crate) use ledger::IndexLedger;
pub(crate) use local::LocalBackend;
pub(crate) use transcript::{TranscriptFile, TranscriptStore};

// ── Shared types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MemoryMode {
    #[serde(rename = "none")]
    Disabled,
    External,
    Local,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "none",
            Self::External => "external",
            Self::Local => "local",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SearchHit {
    pub(crate) content: String,
    pub(crate) similarity: f32,
    pub(crate) file_name: String,
    pub(crate) thread_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub(crate) enum BackendStatus {
    External {
        base_url: String,
        dataset_id: String,
    },
    Local {
        db_path: String,
        model: String,
        initialized: bool,
        total_chunks: Option<usize>,
        total_threads: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MemoryStatus {
    pub(crate) mode: MemoryMode,
    pub(crate) sessions_dir: String,
    pub(crate) total_sessions: usize,
    pub(crate) indexed_sessions: usize,
    pub(crate) pending_sessions: usize,
    #[serde(flatten)]
    pub(crate) backend: Option<BackendStatus>,
}

impl MemoryStatus {
    /// One-line form used in chat status replies.
    pub(crate) fn summary(&self) -> String {
        let mut line = format!("memory: {}", self.mode);
        if self.mode == MemoryMode::Disabled {
            return line;
        }
        line.push_str(&format!(
            " ({} sessions, {} indexed, {} pending)",
            self.total_sessions, self.indexed_sessions, self.pending_sessions
        ));
        if let Some(BackendStatus::Local {
            total_chunks: Some(chunks),
            total_threads: Some(threads),
            ..
        }) = &self.backend
        {
            line.push_str(&format!(", {chunks} chunks across {threads} threads"));
        }
        line
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct IndexReport {
    pub(crate) total: usize,
    pub(crate) pending: usize,
    pub(crate) indexed: usize,
    pub(crate) failed: usize,
}

/// One place transcripts can be indexed into and searched from.
#[async_trait]
pub(crate) trait MemoryBackend: Send + Sync {
    fn mode(&self) -> MemoryMode;

    /// Index one transcript. `content` is the exact bytes read for this
    /// pass; an `Err` leaves the file pending.
    async fn ingest(&self, file: &TranscriptFile, content: Vec<u8>) -> MemoryResult<()>;

    async fn search(&self, query: &str, top_k: usize) -> MemoryResult<Vec<SearchHit>>;

    async fn status(&self) -> BackendStatus;
}

// ── Retriever ────────────────────────────────────────────────────────────

pub(crate) struct HybridRetriever {
    transcripts: TranscriptStore,
    ledger: Mutex<IndexLedger>,
    backend: Option<Arc<dyn MemoryBackend>>,
    default_top_k: usize,
}

impl HybridRetriever {
    /// Pick the backend once. Anything unusable degrades to disabled memory
    /// with a warning rather than failing startup.
    pub(crate) fn from_config(config: &RetrieverConfig) -> Self {
        let backend: Option<Arc<dyn MemoryBackend>> = match config.memory.as_str() {
            "" | "none" => {
                info!("session memory disabled");
                None
            }
            "external" if config.dataset_id.is_empty() => {
                warn!("session memory is external but RAG_DATASET_IDS is empty; memory disabled");
                None
            }
            "external" => match ExternalBackend::new(config) {
                Ok(backend) => {
                    info!(dataset = %config.dataset_id, url = %config.base_url, "external session memory enabled");
                    Some(Arc::new(backend))
                }
                Err(err) => {
                    warn!(error = %err, "could not build retrieval client; memory disabled");
                    None
                }
            },
            "local" => {
                let label = match config.embedding {
                    EmbeddingMode::Fast => LOCAL_MODEL_NAME,
                    EmbeddingMode::Stub => "hashed-bag-of-words",
                };
                match embedding::provider_loader(config.embedding, config.model_cache.clone()) {
                    Some(loader) => {
                        info!(db = %config.embeddings_db().display(), model = label, "local session memory enabled");
                        Some(Arc::new(LocalBackend::new(
                            config.embeddings_db(),
                            label,
                            config.similarity_threshold,
                            loader,
                        )))
                    }
                    None => {
                        warn!(embedding = ?config.embedding, "local embeddings unavailable in this build; memory disabled");
                        None
                    }
                }
            }
            other => {
                warn!(value = other, "unknown CLAUDE_GATEWAY_SESSION_MEMORY; memory disabled");
                None
            }
        };
        Self::with_backend(&config.sessions_dir, backend, config.top_n)
    }

    pub(crate) fn with_backend(
        sessions_dir: &Path,
        backend: Option<Arc<dyn MemoryBackend>>,
        default_top_k: usize,
    ) -> Self {
        Self {
            transcripts: TranscriptStore::new(sessions_dir),
            ledger: Mutex::new(IndexLedger::load(&sessions_dir.join(".indexed.json"))),
            backend,
            default_top_k,
        }
    }

    pub(crate) fn disabled(sessions_dir: &Path) -> Self {
        Self::with_backend(sessions_dir, None, crate::config::DEFAULT_TOP_N)
    }

    pub(crate) fn mode(&self) -> MemoryMode {
        self.backend
            .as_ref()
            .map(|b| b.mode())
            .unwrap_or(MemoryMode::Disabled)
    }

    /// Append a turn to the thread's transcript. Failures are logged only.
    pub(crate) async fn log_turn(&self, thread: &str, user: &str, assistant: &str, label: &str) {
        if self.backend.is_none() {
            return;
        }
        match self.transcripts.append(thread, user, assistant, label).await {
            Ok(path) => info!(thread, file = %path.display(), "turn logged"),
            Err(err) => warn!(thread, error = %err, "failed to log turn"),
        }
    }

    /// Index every transcript whose size differs from the ledger. Passes are
    /// serialized; each success is written through to the ledger, and a
    /// failure leaves that file pending for the next pass.
    pub(crate) async fn index_pending(&self) -> IndexReport {
        let Some(backend) = &self.backend else {
            return IndexReport::default();
        };
        let mut ledger = self.ledger.lock().await;

        let files = match self.transcripts.list().await {
            Ok(files) => files,
            Err(err) => {
                warn!(dir = %self.transcripts.dir().display(), error = %err, "cannot list transcripts");
                return IndexReport::default();
            }
        };
        let pending: Vec<&TranscriptFile> = files
            .iter()
            .filter(|f| ledger.is_pending(&f.name, f.size))
            .collect();

        let mut report = IndexReport {
            total: files.len(),
            pending: pending.len(),
            ..IndexReport::default()
        };
        if pending.is_empty() {
            info!(total = files.len(), indexed = ledger.len(), "no pending transcripts");
            return report;
        }
        info!(pending = pending.len(), total = files.len(), "indexing transcripts");

        for file in pending {
            let content = match tokio::fs::read(&file.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(file = %file.name, error = %err, "cannot read transcript");
                    report.failed += 1;
                    continue;
                }
            };
            let size = content.len() as u64;
            match backend.ingest(file, content).await {
                Ok(()) => {
                    ledger.record(&file.name, size).await;
                    report.indexed += 1;
                    info!(file = %file.name, bytes = size, "transcript indexed");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(file = %file.name, error = %err, "indexing failed, will retry");
                }
            }
        }
        report
    }

    /// Ranked hits for `query`. Backend failures and disabled memory both
    /// come back as an empty list.
    pub(crate) async fn search(&self, query: &str, top_k: Option<usize>) -> Vec<SearchHit> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        let top_k = top_k.unwrap_or(self.default_top_k);
        match backend.search(query, top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "memory search failed");
                Vec::new()
            }
        }
    }

    pub(crate) async fn status(&self) -> MemoryStatus {
        let sessions_dir = self.transcripts.dir().display().to_string();
        let Some(backend) = &self.backend else {
            return MemoryStatus {
                mode: MemoryMode::Disabled,
                sessions_dir,
                total_sessions: 0,
                indexed_sessions: 0,
                pending_sessions: 0,
                backend: None,
            };
        };

        let files = self.transcripts.list().await.unwrap_or_default();
        let ledger = self.ledger.lock().await;
        let pending = files
            .iter()
            .filter(|f| ledger.is_pending(&f.name, f.size))
            .count();
        let indexed = ledger.len();
        drop(ledger);

        MemoryStatus {
            mode: backend.mode(),
            sessions_dir,
            total_sessions: files.len(),
            indexed_sessions: indexed,
            pending_sessions: pending,
            backend: Some(backend.status().await),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records every ingest; fails files whose name is in `reject`.
    #[derive(Default)]
    struct RecordingBackend {
        ingested: StdMutex<Vec<(String, usize)>>,
        reject: StdMutex<Vec<String>>,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl MemoryBackend for RecordingBackend {
        fn mode(&self) -> MemoryMode {
            MemoryMode::Local
        }

        async fn ingest(&self, file: &TranscriptFile, content: Vec<u8>) -> MemoryResult<()> {
            if self.reject.lock().unwrap().contains(&file.name) {
                return Err(crate::error::MemoryError::Embedding("rejected".into()));
            }
            self.ingested
                .lock()
                .unwrap()
                .push((file.name.clone(), content.len()));
            Ok(())
        }

        async fn search(&self, _query: &str, _top_k: usize) -> MemoryResult<Vec<SearchHit>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::MemoryError::Embedding("offline".into()))
        }

        async fn status(&self) -> BackendStatus {
            BackendStatus::Local {
                db_path: String::new(),
                model: "recording".into(),
                initialized: true,
                total_chunks: Some(0),
                total_threads: Some(0),
            }
        }
    }

    fn retriever(dir: &Path) -> (HybridRetriever, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let retriever = HybridRetriever::with_backend(
            dir,
            Some(Arc::clone(&backend) as Arc<dyn MemoryBackend>),
            8,
        );
        (retriever, backend)
    }

    #[tokio::test]
    async fn test_second_pass_does_no_work() {
        let dir = tempfile::tempdir().unwrap();
        let (retriever, backend) = retriever(dir.path());
        retriever.log_turn("1", "hi", "hello", "").await;
        retriever.log_turn("2", "yo", "hey", "").await;

        let first = retriever.index_pending().await;
        assert_eq!(first.indexed, 2);
        let second = retriever.index_pending().await;
        assert_eq!(second, IndexReport { total: 2, pending: 0, indexed: 0, failed: 0 });
        assert_eq!(backend.ingested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_grown_file_is_reindexed_once_with_new_size() {
        let dir = tempfile::tempdir().unwrap();
        let (retriever, backend) = retriever(dir.path());
        let path = dir.path().join("9.md");
        std::fs::write(&path, "a".repeat(500)).unwrap();
        assert_eq!(retriever.index_pending().await.indexed, 1);

        std::fs::write(&path, "b".repeat(900)).unwrap();
        assert_eq!(retriever.index_pending().await.indexed, 1);
        assert_eq!(retriever.index_pending().await.indexed, 0);

        let ingested = backend.ingested.lock().unwrap().clone();
        assert_eq!(ingested, vec![("9.md".to_string(), 500), ("9.md".to_string(), 900)]);
        let ledger = IndexLedger::load(&dir.path().join(".indexed.json"));
        assert_eq!(ledger.recorded("9.md"), Some(900));
    }

    #[tokio::test]
    async fn test_failed_file_stays_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (retriever, backend) = retriever(dir.path());
        std::fs::write(dir.path().join("1.md"), "one").unwrap();
        std::fs::write(dir.path().join("2.md"), "two").unwrap();
        backend.reject.lock().unwrap().push("2.md".to_string());

        let report = retriever.index_pending().await;
        assert_eq!((report.indexed, report.failed), (1, 1));

        backend.reject.lock().unwrap().clear();
        let retry = retriever.index_pending().await;
        assert_eq!((retry.pending, retry.indexed), (1, 1));
        assert_eq!(retriever.status().await.pending_sessions, 0);
    }

    #[tokio::test]
    async fn test_search_errors_become_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (retriever, backend) = retriever(dir.path());
        assert!(retriever.search("anything", None).await.is_empty());
        assert_eq!(backend.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_memory_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = HybridRetriever::disabled(dir.path());
        retriever.log_turn("1", "u", "a", "").await;
        assert!(!dir.path().join("1.md").exists());
        assert_eq!(retriever.index_pending().await, IndexReport::default());
        assert!(retriever.search("q", Some(3)).await.is_empty());
        let status = retriever.status().await;
        assert_eq!(status.mode, MemoryMode::Disabled);
        assert_eq!(status.summary(), "memory: none");
    }

    #[test]
    fn test_mode_selection_falls_back_to_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let external = RetrieverConfig::new("external", dir.path().to_path_buf());
        assert_eq!(HybridRetriever::from_config(&external).mode(), MemoryMode::Disabled);

        let unknown = RetrieverConfig::new("sometimes", dir.path().to_path_buf());
        assert_eq!(HybridRetriever::from_config(&unknown).mode(), MemoryMode::Disabled);

        let mut with_dataset = RetrieverConfig::new("EXTERNAL", dir.path().to_path_buf());
        with_dataset.dataset_id = "ds".to_string();
        assert_eq!(HybridRetriever::from_config(&with_dataset).mode(), MemoryMode::External);

        let mut local = RetrieverConfig::new("local", dir.path().to_path_buf());
        local.embedding = EmbeddingMode::Stub;
        assert_eq!(HybridRetriever::from_config(&local).mode(), MemoryMode::Local);
    }

    #[cfg(not(feature = "vec"))]
    #[test]
    fn test_local_fast_without_vec_feature_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = RetrieverConfig::new("local", dir.path().to_path_buf());
        assert_eq!(config.embedding, EmbeddingMode::Fast);
        assert_eq!(HybridRetriever::from_config(&config).mode(), MemoryMode::Disabled);
    }

    #[tokio::test]
    async fn test_local_stub_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RetrieverConfig::new("local", dir.path().to_path_buf());
        config.embedding = EmbeddingMode::Stub;
        let retriever = HybridRetriever::from_config(&config);

        retriever
            .log_turn("11", "how do I rotate the kafka certificates", "run the rotation playbook", "Ops")
            .await;
        retriever
            .log_turn("12", "favourite pasta recipe", "cacio e pepe", "Food")
            .await;
        assert_eq!(retriever.index_pending().await.indexed, 2);

        let hits = retriever
            .search("rotate the kafka certificates", Some(1))
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].thread_id, "11");

        let status = retriever.status().await;
        assert_eq!(status.total_sessions, 2);
        assert_eq!(status.indexed_sessions, 2);
        assert!(status.summary().contains("2 threads"));
    }
}
