use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, multipart};
use serde_json::{Value, json};
use tracing::info;

use super::transcript::TranscriptFile;
use super::{BackendStatus, MemoryBackend, MemoryMode, SearchHit};
use crate::config::RetrieverConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::util::truncate_chars;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DOCUMENT_PREFIX: &str = "oldsessions_";

/// Remote retrieval service. Chunking and embedding happen server side;
/// this side uploads transcripts and asks questions.
pub(crate) struct ExternalBackend {
    client: Client,
    base_url: String,
    api_key: String,
    dataset_id: String,
}

impl ExternalBackend {
    pub(crate) fn new(config: &RetrieverConfig) -> MemoryResult<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            dataset_id: config.dataset_id.clone(),
        })
    }

    async fn upload(&self, file_name: &str, content: Vec<u8>) -> MemoryResult<String> {
        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(content)
                .file_name(file_name.to_string())
                .mime_str("text/markdown")?,
        );
        let response = self
            .client
            .post(format!("{}/api/v1/datasets/{}/documents", self.base_url, self.dataset_id))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Status {
                step: "upload",
                status,
                body: truncate_chars(&body, 200).to_string(),
            });
        }
        let body: Value = response.json().await?;
        extract_document_id(&body).ok_or(MemoryError::MissingDocumentId)
    }

    async fn trigger_parse(&self, document_id: &str) -> MemoryResult<()> {
        let response = self
            .client
            .post(format!("{}/api/v1/datasets/{}/chunks", self.base_url, self.dataset_id))
            .bearer_auth(&self.api_key)
            .json(&json!({ "document_ids": [document_id] }))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Status {
                step: "parse",
                status,
                body: truncate_chars(&body, 200).to_string(),
            });
        }
        Ok(())
    }

    async fn query(&self, question: &str, top_k: usize) -> MemoryResult<Vec<SearchHit>> {
        let response = self
            .client
            .post(format!("{}/api/v1/retrieval", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "question": question,
                "dataset_ids": [self.dataset_id],
                "top_n": top_k,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Status {
                step: "retrieval",
                status,
                body: truncate_chars(&body, 200).to_string(),
            });
        }
        let body: Value = response.json().await?;
        Ok(parse_hits(&body))
    }
}

/// The upload response wraps the document either as `data: {...}` or as
/// `data: [{...}]`.
pub(crate) fn extract_document_id(body: &Value) -> Option<String> {
    let data = body.get("data")?;
    let doc = match data {
        Value::Array(items) => items.first()?,
        Value::Object(_) => data,
        _ => return None,
    };
    doc.get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn parse_hits(body: &Value) -> Vec<SearchHit> {
    let Some(chunks) = body
        .get("data")
        .and_then(|d| d.get("chunks"))
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };
    chunks
        .iter()
        .map(|item| {
            let text = |key: &str| {
                item.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let document_id = text("document_id");
            SearchHit {
                content: text("content"),
                similarity: item.get("similarity").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                file_name: text("document_name"),
                thread_id: document_id.replace(DOCUMENT_PREFIX, ""),
            }
        })
        .collect()
}

#[async_trait]
impl MemoryBackend for ExternalBackend {
    fn mode(&self) -> MemoryMode {
        MemoryMode::External
    }

    async fn ingest(&self, file: &TranscriptFile, content: Vec<u8>) -> MemoryResult<()> {
        let document_id = self.upload(&file.name, content).await?;
        self.trigger_parse(&document_id).await?;
        info!(file = %file.name, document = truncate_chars(&document_id, 8), "transcript uploaded");
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> MemoryResult<Vec<SearchHit>> {
        self.query(query, top_k).await
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus::External {
            base_url: self.base_url.clone(),
            dataset_id: self.dataset_id.clone(),
        }
    }
}
