use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::MemoryResult;

pub(crate) const TRANSCRIPT_EXT: &str = "md";

/// A transcript file as seen by an indexing pass.
#[derive(Debug, Clone)]
pub(crate) struct TranscriptFile {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
}

impl TranscriptFile {
    /// Thread id is the file stem: `<thread>.md`.
    pub(crate) fn thread_id(&self) -> &str {
        self.name
            .strip_suffix(".md")
            .unwrap_or(self.name.as_str())
    }
}

pub(crate) fn render_header(thread: &str, label: &str) -> String {
    let title = if label.trim().is_empty() { thread } else { label };
    format!("# Session: {title}\n\n")
}

pub(crate) fn render_entry(at: DateTime<Local>, user: &str, assistant: &str) -> String {
    format!(
        "## {}\n\n**User:** {user}\n\n**Assistant:** {assistant}\n\n---\n\n",
        at.format("%Y-%m-%d %H:%M")
    )
}

/// Append-only Markdown transcripts, one file per thread.
#[derive(Debug, Clone)]
pub(crate) struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn path_for(&self, thread: &str) -> PathBuf {
        self.dir.join(format!("{thread}.{TRANSCRIPT_EXT}"))
    }

    /// Append one turn, writing the header first if the file is new.
    pub(crate) async fn append(
        &self,
        thread: &str,
        user: &str,
        assistant: &str,
        label: &str,
    ) -> MemoryResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(thread);

        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                file.write_all(render_header(thread, label).as_bytes()).await?;
                file.flush().await?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }

        let mut file = OpenOptions::new().append(true).open(&path).await?;
        file.write_all(render_entry(Local::now(), user, assistant).as_bytes())
            .await?;
        file.flush().await?;
        Ok(path)
    }

    /// All transcripts currently on disk. A missing directory is empty.
    pub(crate) async fn list(&self) -> MemoryResult<Vec<TranscriptFile>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXT) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            files.push(TranscriptFile {
                name: name.to_string(),
                size: meta.len(),
                path: path.clone(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
