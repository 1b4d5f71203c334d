use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::util::{env_f32, env_optional, env_string, env_u64, env_usize};

// ── Defaults ─────────────────────────────────────────────────────────────

pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub(crate) const EXIT_GRACE: Duration = Duration::from_secs(5);
pub(crate) const SEGMENT_LIMIT: usize = 1900;
pub(crate) const SEGMENT_PAUSE: Duration = Duration::from_millis(300);

pub(crate) const DEFAULT_RETRIEVER_URL: &str = "http://localhost:9380";
pub(crate) const DEFAULT_RETRIEVER_KEY: &str = "secret-key";
pub(crate) const DEFAULT_TOP_N: usize = 8;
pub(crate) const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.2;

/// `~/.claude/gateway-sessions`, or the current directory when no home exists.
pub(crate) fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("gateway-sessions")
}

/// Shell-word split of `CLAUDE_EXTRA_ARGS`. Unbalanced quoting falls back to
/// plain whitespace splitting.
pub(crate) fn split_extra_args(raw: &str) -> Vec<String> {
    match shlex::split(raw) {
        Some(args) => args,
        None => {
            warn!(value = raw, "CLAUDE_EXTRA_ARGS has unbalanced quoting, splitting on whitespace");
            raw.split_whitespace().map(str::to_string).collect()
        }
    }
}

fn assistant_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

// ── Gateway ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct GatewayConfig {
    pub(crate) program: String,
    pub(crate) extra_args: Vec<String>,
    pub(crate) timeout: Duration,
    pub(crate) grace: Duration,
    pub(crate) segment_limit: usize,
    pub(crate) segment_pause: Duration,
    pub(crate) home: PathBuf,
    pub(crate) settings_path: Option<PathBuf>,
}

impl GatewayConfig {
    pub(crate) fn new(program: impl Into<String>, home: PathBuf) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            grace: EXIT_GRACE,
            segment_limit: SEGMENT_LIMIT,
            segment_pause: SEGMENT_PAUSE,
            home,
            settings_path: None,
        }
    }

    pub(crate) fn from_env() -> Self {
        let home = env_optional("GATEWAY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        let mut config = Self::new(env_string("CLAUDE_BIN", "claude"), home);
        if let Some(raw) = env_optional("CLAUDE_EXTRA_ARGS") {
            config.extra_args = split_extra_args(&raw);
        }
        config.timeout = Duration::from_secs(env_u64("CLAUDE_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS));
        config.settings_path = assistant_settings_path();
        config
    }

    pub(crate) fn sessions_file(&self) -> PathBuf {
        self.home.join("sessions.json")
    }
}

// ── Retriever ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmbeddingMode {
    /// fastembed model, requires the `vec` feature.
    Fast,
    /// Deterministic hashed vectors. No model download.
    Stub,
}

#[derive(Debug, Clone)]
pub(crate) struct RetrieverConfig {
    /// Raw `CLAUDE_GATEWAY_SESSION_MEMORY` value, normalized to lowercase.
    pub(crate) memory: String,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) dataset_id: String,
    pub(crate) sessions_dir: PathBuf,
    pub(crate) top_n: usize,
    pub(crate) similarity_threshold: f32,
    pub(crate) embedding: EmbeddingMode,
    pub(crate) model_cache: PathBuf,
}

impl RetrieverConfig {
    pub(crate) fn new(memory: &str, sessions_dir: PathBuf) -> Self {
        Self {
            memory: memory.trim().to_ascii_lowercase(),
            base_url: DEFAULT_RETRIEVER_URL.to_string(),
            api_key: DEFAULT_RETRIEVER_KEY.to_string(),
            dataset_id: String::new(),
            model_cache: sessions_dir.join("models"),
            sessions_dir,
            top_n: DEFAULT_TOP_N,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            embedding: EmbeddingMode::Fast,
        }
    }

    pub(crate) fn from_env(sessions_dir: PathBuf) -> Self {
        let mut config = Self::new(&env_string("CLAUDE_GATEWAY_SESSION_MEMORY", "none"), sessions_dir);
        config.base_url = env_string("RETRIEVER_BASE_URL", DEFAULT_RETRIEVER_URL);
        config.api_key = env_string("RETRIEVER_API_KEY", DEFAULT_RETRIEVER_KEY);
        config.dataset_id = env_string("RAG_DATASET_IDS", "").trim().to_string();
        config.top_n = env_usize("RETRIEVER_TOP_N", DEFAULT_TOP_N);
        config.similarity_threshold =
            env_f32("RETRIEVER_SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD);
        config.embedding = match env_string("LOCAL_EMBEDDING_MODE", "fast").trim().to_ascii_lowercase().as_str() {
            "fast" => EmbeddingMode::Fast,
            "stub" => EmbeddingMode::Stub,
            other => {
                warn!(value = other, "unknown LOCAL_EMBEDDING_MODE, using fast");
                EmbeddingMode::Fast
            }
        };
        if let Some(cache) = env_optional("LOCAL_EMBEDDING_CACHE") {
            config.model_cache = PathBuf::from(cache);
        }
        config
    }

    pub(crate) fn embeddings_db(&self) -> PathBuf {
        self.sessions_dir.join("embeddings.db")
    }
}
