use thiserror::Error;

pub(crate) type MemoryResult<T> = std::result::Result<T, MemoryError>;
pub(crate) type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Failures inside the memory subsystem. Most of these are contained at the
/// retriever boundary and only ever reach a log line.
#[derive(Error, Debug)]
pub(crate) enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{step} failed with status {status}: {body}")]
    Status {
        step: &'static str,
        status: u16,
        body: String,
    },

    #[error("upload response carried no document id")]
    MissingDocumentId,

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("chunk overlap {overlap} must be smaller than chunk size {size}")]
    InvalidChunking { size: usize, overlap: usize },

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

#[derive(Error, Debug)]
pub(crate) enum GatewayError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("gateway coordinator has stopped")]
    CoordinatorGone,
}
