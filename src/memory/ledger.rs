use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::util::save_json_atomic;

/// On-disk shapes of `.indexed.json`. Older deployments stored a plain list
/// of file names; those load with a recorded size of zero so every listed
/// file is picked up again on the next pass.
#[derive(Deserialize)]
#[serde(untagged)]
enum LedgerFile {
    Sizes(BTreeMap<String, u64>),
    Legacy(Vec<String>),
}

/// File name → byte size at the last successful indexing.
#[derive(Debug)]
pub(crate) struct IndexLedger {
    path: PathBuf,
    entries: BTreeMap<String, u64>,
}

impl IndexLedger {
    /// Load the ledger at `path`. A missing or unreadable file yields an
    /// empty ledger, which makes every transcript pending.
    pub(crate) fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<LedgerFile>(&raw) {
                Ok(LedgerFile::Sizes(map)) => map,
                Ok(LedgerFile::Legacy(names)) => names.into_iter().map(|n| (n, 0)).collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable index ledger, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub(crate) fn is_pending(&self, file_name: &str, current_size: u64) -> bool {
        self.entries.get(file_name) != Some(&current_size)
    }

    pub(crate) fn recorded(&self, file_name: &str) -> Option<u64> {
        self.entries.get(file_name).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) async fn save(&self) -> std::io::Result<()> {
        save_json_atomic(&self.path, &self.entries).await
    }

    /// Record a successful indexing and write the ledger through to disk.
    /// A failed write is logged; the in-memory entry stays authoritative.
    pub(crate) async fn record(&mut self, file_name: &str, size: u64) {
        self.entries.insert(file_name.to_string(), size);
        if let Err(err) = self.save().await {
            warn!(path = %self.path.display(), error = %err, "failed to persist index ledger");
        }
    }
}
