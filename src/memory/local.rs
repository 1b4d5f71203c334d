use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::task::spawn_blocking;
use tracing::info;

use super::chunker::{CHUNK_OVERLAP, CHUNK_SIZE, chunk_text};
use super::embedding::{EmbeddingProvider, ProviderLoader};
use super::transcript::TranscriptFile;
use super::vector_store::{StoreStats, VectorStore};
use super::{BackendStatus, MemoryBackend, MemoryMode, SearchHit};
use crate::error::{MemoryError, MemoryResult};

struct LocalState {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<VectorStore>,
}

/// Embedded backend: chunks and embeds transcripts in-process and keeps the
/// vectors in SQLite. Nothing is loaded until the first ingest or search.
pub(crate) struct LocalBackend {
    db_path: PathBuf,
    model_label: String,
    threshold: f32,
    loader: ProviderLoader,
    state: OnceCell<LocalState>,
}

impl LocalBackend {
    pub(crate) fn new(
        db_path: PathBuf,
        model_label: impl Into<String>,
        threshold: f32,
        loader: ProviderLoader,
    ) -> Self {
        Self {
            db_path,
            model_label: model_label.into(),
            threshold,
            loader,
            state: OnceCell::new(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// Load the model and open the store exactly once, off the async thread.
    /// Concurrent first callers wait on the same load.
    async fn state(&self) -> MemoryResult<&LocalState> {
        self.state
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let db_path = self.db_path.clone();
                let state = spawn_blocking(move || -> MemoryResult<LocalState> {
                    let provider = loader()?;
                    let store = VectorStore::open_or_create(&db_path)?;
                    info!(db = %db_path.display(), model = provider.model(), "local memory ready");
                    Ok(LocalState {
                        provider,
                        store: Arc::new(store),
                    })
                })
                .await??;
                Ok::<LocalState, MemoryError>(state)
            })
            .await
    }

    async fn stats(&self) -> MemoryResult<StoreStats> {
        if let Some(state) = self.state.get() {
            let store = Arc::clone(&state.store);
            return spawn_blocking(move || store.stats()).await?;
        }
        if !self.db_path.exists() {
            return Ok(StoreStats::default());
        }
        let db_path = self.db_path.clone();
        spawn_blocking(move || -> MemoryResult<StoreStats> {
            VectorStore::open_or_create(&db_path)?.stats()
        })
        .await?
    }
}

#[async_trait]
impl MemoryBackend for LocalBackend {
    fn mode(&self) -> MemoryMode {
        MemoryMode::Local
    }

    async fn ingest(&self, file: &TranscriptFile, content: Vec<u8>) -> MemoryResult<()> {
        let state = self.state().await?;
        let text = String::from_utf8_lossy(&content).into_owned();
        let chunks = if text.trim().is_empty() {
            Vec::new()
        } else {
            chunk_text(&text, CHUNK_SIZE, CHUNK_OVERLAP)?
        };

        let provider = Arc::clone(&state.provider);
        let store = Arc::clone(&state.store);
        let thread_id = file.thread_id().to_string();
        let file_name = file.name.clone();
        let written = spawn_blocking(move || -> MemoryResult<usize> {
            let vectors = if chunks.is_empty() {
                Vec::new()
            } else {
                provider.embed_batch(&chunks)?
            };
            if vectors.len() != chunks.len() {
                return Err(MemoryError::Embedding(format!(
                    "expected {} vectors, got {}",
                    chunks.len(),
                    vectors.len()
                )));
            }
            store.replace_thread(&thread_id, &file_name, &chunks, &vectors)
        })
        .await??;

        info!(file = %file.name, chunks = written, "transcript embedded");
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> MemoryResult<Vec<SearchHit>> {
        let state = self.state().await?;
        let provider = Arc::clone(&state.provider);
        let store = Arc::clone(&state.store);
        let query = query.to_string();
        let threshold = self.threshold;
        spawn_blocking(move || -> MemoryResult<Vec<SearchHit>> {
            let vector = provider.embed_text(&query)?;
            store.search(&vector, top_k, threshold)
        })
        .await?
    }

    async fn status(&self) -> BackendStatus {
        let (chunks, threads) = match self.stats().await {
            Ok(stats) => (Some(stats.chunks), Some(stats.threads)),
            Err(err) => {
                tracing::warn!(error = %err, "could not read local memory stats");
                (None, None)
            }
        };
        let model = match self.state.get() {
            Some(state) => state.provider.model().to_string(),
            None => self.model_label.clone(),
        };
        BackendStatus::Local {
            db_path: self.db_path.display().to_string(),
            model,
            initialized: self.is_initialized(),
            total_chunks: chunks,
            total_threads: threads,
        }
    }
}
