//! SQLite chunk store for the local memory backend.
//!
//! One row per chunk, keyed by `(thread_id, chunk_idx)`. Vectors are stored as
//! little-endian f32 blobs and compared with a full scan; transcript-scale
//! corpora stay small enough that no approximate index is needed.

use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use rusqlite::{Connection, params};

use super::SearchHit;
use super::embedding::dot;
use crate::error::MemoryResult;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    chunk_idx INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    UNIQUE(thread_id, chunk_idx)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_thread ON embeddings(thread_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_file ON embeddings(file_name);
";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StoreStats {
    pub(crate) chunks: usize,
    pub(crate) threads: usize,
}

pub(crate) struct VectorStore {
    conn: Mutex<Connection>,
}

impl VectorStore {
    /// Open or create the store, creating parent directories as needed.
    pub(crate) fn open_or_create(path: &Path) -> MemoryResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace every chunk stored for `thread_id` with `chunks`, in one
    /// transaction. Returns the number of rows written.
    pub(crate) fn replace_thread(
        &self,
        thread_id: &str,
        file_name: &str,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) -> MemoryResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM embeddings WHERE thread_id = ?1", params![thread_id])?;
        let timestamp = Local::now().to_rfc3339();
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO embeddings
                 (thread_id, file_name, chunk_idx, content, embedding, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (idx, (chunk, vector)) in chunks.iter().zip(vectors).enumerate() {
                insert.execute(params![
                    thread_id,
                    file_name,
                    idx as i64,
                    chunk,
                    encode_vector(vector),
                    timestamp
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len().min(vectors.len()))
    }

    /// Dot product against every stored vector, keeping hits at or above
    /// `threshold`, best first.
    pub(crate) fn search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> MemoryResult<Vec<SearchHit>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT thread_id, file_name, content, embedding FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (thread_id, file_name, content, blob) = row?;
            let similarity = dot(query, &decode_vector(&blob));
            if similarity >= threshold {
                hits.push(SearchHit {
                    content,
                    similarity,
                    file_name,
                    thread_id,
                });
            }
        }
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub(crate) fn stats(&self) -> MemoryResult<StoreStats> {
        let conn = self.conn();
        let (chunks, threads) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT thread_id) FROM embeddings",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(StoreStats {
            chunks: chunks as usize,
            threads: threads as usize,
        })
    }

    #[cfg(test)]
    pub(crate) fn thread_chunks(&self, thread_id: &str) -> MemoryResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT content FROM embeddings WHERE thread_id = ?1 ORDER BY chunk_idx",
        )?;
        let rows = stmt.query_map(params![thread_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
