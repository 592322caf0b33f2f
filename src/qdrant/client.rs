//! HTTP client wrapper exposing a Qdrant collection as a [`VectorStore`].

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};

use crate::qdrant::{
    filters::{document_filter, owner_filter, stale_tail_filter},
    payload::{build_point, entry_from_payload, metadata_from_payload, point_id},
    types::{CountResponse, QdrantError, RetrieveResponse, ScrollResponse},
};
use crate::vector_store::{
    StoreSummary, StoredFile, VectorStore, VectorStoreEntry, VectorStoreError, last_indexes,
    summarize_files, validate_entries,
};

const SCROLL_PAGE: usize = 512;

/// Lightweight HTTP client storing document chunks in one Qdrant collection.
pub struct QdrantVectorStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) collection: String,
    pub(crate) dimension: usize,
}

impl QdrantVectorStore {
    /// Construct a client for `collection` at `url`.
    pub fn new(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
    ) -> Result<Self, QdrantError> {
        let client = Client::builder().user_agent("rusty-ingest/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(QdrantError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Create the collection and payload indexes when missing.
    pub async fn initialize(&self) -> Result<(), QdrantError> {
        if !self.collection_exists().await? {
            tracing::info!(
                collection = %self.collection,
                vector_size = self.dimension,
                "Creating collection"
            );
            self.create_collection().await?;
        }
        self.ensure_payload_indexes().await
    }

    async fn create_collection(&self) -> Result<(), QdrantError> {
        let body = json!({
            "vectors": {
                "size": self.dimension,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))?
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, "Collection ensured/created");
        })
        .await
    }

    /// Ensure payload indexes exist for the ownership filters.
    pub async fn ensure_payload_indexes(&self) -> Result<(), QdrantError> {
        let fields: [(&str, &str); 4] = [
            ("agent_id", "keyword"),
            ("user_id", "keyword"),
            ("document_id", "keyword"),
            ("chunk_index", "integer"),
        ];

        for (field, schema) in fields {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(Method::PUT, &format!("collections/{}/index", self.collection))?
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index ensured");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::warn!(collection = %self.collection, field, schema, error = %error, "Failed to ensure payload index");
            }
        }

        Ok(())
    }

    async fn collection_exists(&self) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))?
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn count(&self, filter: Value) -> Result<usize, QdrantError> {
        let response = self
            .request(Method::POST, &format!("collections/{}/points/count", self.collection))?
            .json(&json!({ "filter": filter, "exact": true }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let CountResponse { result } = response.json().await?;
        Ok(result.count)
    }

    async fn delete_by_filter(&self, filter: Value) -> Result<(), QdrantError> {
        let response = self
            .request(Method::POST, &format!("collections/{}/points/delete", self.collection))?
            .query(&[("wait", true)])
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        self.ensure_success(response, || {}).await
    }

    async fn existing_ids(&self, ids: Vec<String>) -> Result<usize, QdrantError> {
        let response = self
            .request(Method::POST, &format!("collections/{}/points", self.collection))?
            .json(&json!({ "ids": ids, "with_payload": false, "with_vector": false }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let RetrieveResponse { result } = response.json().await?;
        Ok(result.len())
    }

    async fn upsert(&self, points: Vec<Value>) -> Result<(), QdrantError> {
        let point_count = points.len();
        let response = self
            .request(Method::PUT, &format!("collections/{}/points", self.collection))?
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, points = point_count, "Points upserted");
        })
        .await
    }

    async fn scroll(
        &self,
        filter: Value,
        with_vector: bool,
    ) -> Result<Vec<(Map<String, Value>, Vec<f32>)>, QdrantError> {
        let mut offset: Option<Value> = None;
        let mut points = Vec::new();

        loop {
            let mut body = json!({
                "with_payload": true,
                "with_vector": with_vector,
                "limit": SCROLL_PAGE,
                "filter": filter.clone(),
            });
            if let (Some(next), Some(object)) = (offset.take(), body.as_object_mut()) {
                object.insert("offset".into(), next);
            }

            let response = self
                .request(Method::POST, &format!("collections/{}/points/scroll", self.collection))?
                .json(&body)
                .send()
                .await?;
            let response = Self::check(response).await?;

            let ScrollResponse { result } = response.json().await?;
            for point in result.points {
                if let Some(payload) = point.payload {
                    points.push((payload, point.vector.unwrap_or_default()));
                }
            }

            match result.next_page_offset {
                Some(Value::Null) | None => break,
                Some(next) => offset = Some(next),
            }
        }

        Ok(points)
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, QdrantError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, QdrantError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = QdrantError::UnexpectedStatus { status, body };
        tracing::error!(error = %error, "Qdrant request failed");
        Err(error)
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), QdrantError>
    where
        F: FnOnce(),
    {
        Self::check(response).await?;
        on_success();
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn store(
        &self,
        agent_id: &str,
        user_id: &str,
        entries: Vec<VectorStoreEntry>,
    ) -> Result<StoreSummary, VectorStoreError> {
        if entries.is_empty() {
            return Ok(StoreSummary::default());
        }
        validate_entries(&entries, Some(self.dimension))?;

        let mut summary = StoreSummary::default();
        for (document_id, last_index) in last_indexes(&entries) {
            let filter = stale_tail_filter(agent_id, user_id, &document_id, last_index);
            let stale = self.count(filter.clone()).await?;
            if stale > 0 {
                self.delete_by_filter(filter).await?;
                summary.removed_stale += stale;
            }
        }

        let ids = entries
            .iter()
            .map(|entry| point_id(agent_id, user_id, &entry.id))
            .collect();
        summary.updated = self.existing_ids(ids).await?;
        summary.inserted = entries.len().saturating_sub(summary.updated);

        let points = entries
            .iter()
            .map(|entry| build_point(agent_id, user_id, entry))
            .collect();
        self.upsert(points).await?;
        Ok(summary)
    }

    async fn list(&self, agent_id: &str, user_id: &str) -> Result<Vec<StoredFile>, VectorStoreError> {
        let points = self.scroll(owner_filter(agent_id, user_id), false).await?;
        let metadata = points
            .iter()
            .map(|(payload, _)| metadata_from_payload(payload))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summarize_files(metadata.iter()))
    }

    async fn get(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, VectorStoreError> {
        let points = self
            .scroll(document_filter(agent_id, user_id, document_id), true)
            .await?;
        if points.is_empty() {
            return Err(VectorStoreError::NotFound {
                document_id: document_id.to_string(),
            });
        }
        let mut entries = points
            .into_iter()
            .map(|(payload, vector)| entry_from_payload(&payload, vector))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.metadata.chunk_index);
        Ok(entries)
    }

    async fn delete(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, VectorStoreError> {
        let filter = document_filter(agent_id, user_id, document_id);
        let removed = self.count(filter.clone()).await?;
        if removed == 0 {
            return Err(VectorStoreError::NotFound {
                document_id: document_id.to_string(),
            });
        }
        self.delete_by_filter(filter).await?;
        Ok(removed)
    }

    async fn health(&self) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            Ok(())
        } else {
            Err(QdrantError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND,
                body: format!("collection '{}' is missing", self.collection),
            }
            .into())
        }
    }

    fn backend_name(&self) -> &'static str {
        "qdrant"
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
