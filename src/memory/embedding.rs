use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EmbeddingMode;
use crate::error::MemoryResult;

pub(crate) const LOCAL_MODEL_NAME: &str = "paraphrase-multilingual-MiniLM-L12-v2";
pub(crate) const EMBED_BATCH_SIZE: usize = 32;
const HASH_DIMENSION: usize = 384;

/// Something that turns text into unit-length vectors.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub(crate) trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn embed_text(&self, text: &str) -> MemoryResult<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed_text(text)).collect()
    }
}

/// Builds the provider on first use. Loading may download and initialize a
/// model, so it runs once on a blocking thread.
pub(crate) type ProviderLoader =
    Arc<dyn Fn() -> MemoryResult<Arc<dyn EmbeddingProvider>> + Send + Sync>;

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Loader for the configured embedding mode, or `None` when that mode is
/// not available in this build.
pub(crate) fn provider_loader(mode: EmbeddingMode, cache_dir: PathBuf) -> Option<ProviderLoader> {
    match mode {
        EmbeddingMode::Stub => Some(Arc::new(|| {
            Ok(Arc::new(HashEmbedder::new(HASH_DIMENSION)) as Arc<dyn EmbeddingProvider>)
        })),
        EmbeddingMode::Fast => fast_loader(cache_dir),
    }
}

#[cfg(feature = "vec")]
fn fast_loader(cache_dir: PathBuf) -> Option<ProviderLoader> {
    Some(Arc::new(move || {
        let provider = fast::FastEmbedProvider::load(cache_dir.clone())?;
        Ok(Arc::new(provider) as Arc<dyn EmbeddingProvider>)
    }))
}

#[cfg(not(feature = "vec"))]
fn fast_loader(_cache_dir: PathBuf) -> Option<ProviderLoader> {
    tracing::warn!(
        "LOCAL_EMBEDDING_MODE=fast needs a build with --features vec; \
         set LOCAL_EMBEDDING_MODE=stub to keep local memory on with hashed embeddings"
    );
    None
}

// ── Hashed bag-of-words ──────────────────────────────────────────────────

/// Deterministic lexical embedder: every lowercase word is hashed into a
/// signed bucket. Texts sharing words point the same way; identical texts
/// produce identical vectors.
#[derive(Debug, Clone)]
pub(crate) struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model(&self) -> &str {
        "hashed-bag-of-words"
    }

    fn embed_text(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut state = fnv1a_64(word.to_lowercase().as_bytes());
            let bits = splitmix64(&mut state);
            let bucket = (bits % self.dimension as u64) as usize;
            let sign = if bits >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ── fastembed ────────────────────────────────────────────────────────────

#[cfg(feature = "vec")]
mod fast {
    use std::path::PathBuf;

    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tracing::info;

    use super::{EMBED_BATCH_SIZE, EmbeddingProvider, LOCAL_MODEL_NAME, l2_normalize};
    use crate::error::{MemoryError, MemoryResult};

    pub(crate) struct FastEmbedProvider {
        model: TextEmbedding,
    }

    impl FastEmbedProvider {
        pub(crate) fn load(cache_dir: PathBuf) -> MemoryResult<Self> {
            std::fs::create_dir_all(&cache_dir)?;
            info!(model = LOCAL_MODEL_NAME, cache = %cache_dir.display(), "loading embedding model");
            let options = InitOptions::new(EmbeddingModel::ParaphraseMLMiniLML12V2)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options)
                .map_err(|e| MemoryError::Embedding(e.to_string()))?;
            let warmup = model
                .embed(vec!["warmup"], None)
                .map_err(|e| MemoryError::Embedding(e.to_string()))?;
            let dimension = warmup.first().map(|v| v.len()).unwrap_or(0);
            info!(dimension, "embedding model ready");
            Ok(Self { model })
        }
    }

    impl EmbeddingProvider for FastEmbedProvider {
        fn model(&self) -> &str {
            LOCAL_MODEL_NAME
        }

        fn embed_text(&self, text: &str) -> MemoryResult<Vec<f32>> {
            let mut out = self.embed_batch(&[text.to_string()])?;
            out.pop()
                .ok_or_else(|| MemoryError::Embedding("model returned no vector".to_string()))
        }

        fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
            let mut vectors = self
                .model
                .embed(texts.to_vec(), Some(EMBED_BATCH_SIZE))
                .map_err(|e| MemoryError::Embedding(e.to_string()))?;
            for vector in vectors.iter_mut() {
                l2_normalize(vector);
            }
            Ok(vectors)
        }
    }
}
