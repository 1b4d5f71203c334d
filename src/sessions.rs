use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::util::save_json_atomic;

/// Namespace for thread → session id derivation. Changing it orphans every
/// existing assistant session.
pub(crate) const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0xa3f1b2c4_d5e6_7890_abcd_ef1234567890);

/// Session id for `thread`, reproducible from the thread key alone.
pub(crate) fn session_id_for(thread: &str) -> Uuid {
    Uuid::new_v5(&SESSION_NAMESPACE, thread.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    pub(crate) session_id: Uuid,
    #[serde(default)]
    pub(crate) initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) model: Option<String>,
}

impl SessionRecord {
    fn fresh(thread: &str) -> Self {
        Self {
            session_id: session_id_for(thread),
            initialized: false,
            model: None,
        }
    }

    pub(crate) fn short_id(&self) -> String {
        self.session_id.simple().to_string()[..8].to_string()
    }
}

/// Thread key → session record, written through to `sessions.json` on every
/// change. The file is a cache: ids can always be recomputed.
pub(crate) struct SessionMap {
    path: PathBuf,
    records: Mutex<BTreeMap<String, SessionRecord>>,
}

impl SessionMap {
    pub(crate) fn load(path: &Path) -> Self {
        let records = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, SessionRecord>>(&raw) {
                Ok(map) => {
                    info!(sessions = map.len(), "session map loaded");
                    map
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable session map, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        }
    }

    async fn persist(&self, records: &BTreeMap<String, SessionRecord>) {
        if let Err(err) = save_json_atomic(&self.path, records).await {
            warn!(path = %self.path.display(), error = %err, "failed to persist session map");
        }
    }

    /// Record for `thread`, creating it on first access. The flag is `true`
    /// when the record was created by this call.
    pub(crate) async fn resolve(&self, thread: &str) -> (SessionRecord, bool) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get(thread) {
            return (record.clone(), false);
        }
        let record = SessionRecord::fresh(thread);
        records.insert(thread.to_string(), record.clone());
        self.persist(&records).await;
        (record, true)
    }

    pub(crate) async fn get(&self, thread: &str) -> Option<SessionRecord> {
        self.records.lock().await.get(thread).cloned()
    }

    pub(crate) async fn is_initialized(&self, thread: &str) -> bool {
        self.records
            .lock()
            .await
            .get(thread)
            .is_some_and(|record| record.initialized)
    }

    pub(crate) async fn model(&self, thread: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(thread)
            .and_then(|record| record.model.clone())
    }

    pub(crate) async fn mark_initialized(&self, thread: &str) {
        let mut records = self.records.lock().await;
        match records.get_mut(thread) {
            Some(record) if !record.initialized => record.initialized = true,
            _ => return,
        }
        self.persist(&records).await;
    }

    /// Set or clear the model override. Only existing records are touched;
    /// returns whether one was found.
    pub(crate) async fn set_model(&self, thread: &str, model: Option<String>) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(thread) else {
            return false;
        };
        record.model = model.filter(|m| !m.trim().is_empty());
        self.persist(&records).await;
        true
    }

    pub(crate) async fn remove(&self, thread: &str) -> bool {
        let mut records = self.records.lock().await;
        let removed = records.remove(thread).is_some();
        self.persist(&records).await;
        removed
    }

    pub(crate) async fn records(&self) -> Vec<(String, SessionRecord)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
