//! Persistence of embedded chunks, scoped by owning agent and user.
//!
//! [`VectorStore`] is the seam between the worker and a storage backend. Two backends ship with
//! the crate: [`InMemoryVectorStore`] for tests and single-process deployments, and
//! [`crate::qdrant::QdrantVectorStore`] for a Qdrant collection reached over REST.

mod cache;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

use crate::processing::Chunk;
use crate::qdrant::QdrantError;

pub use cache::{DEFAULT_LISTING_CAPACITY, FileListingCache, ListingCacheStats, VectorStoreService};
pub use memory::InMemoryVectorStore;

/// Errors raised by vector store backends.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// No rows exist for the document under the given owner.
    #[error("document '{document_id}' not found")]
    NotFound {
        /// Requested document.
        document_id: String,
    },
    /// A vector does not match the store's dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the store was created with.
        expected: usize,
        /// Dimension received.
        actual: usize,
    },
    /// Entry failed structural checks before being written.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    /// Qdrant backend failure.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
}

/// Metadata persisted alongside each chunk vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Document the chunk belongs to.
    pub document_id: String,
    /// Zero-based position of the chunk within the document.
    pub chunk_index: usize,
    /// File name supplied at upload time.
    pub original_name: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Size of the source file in bytes.
    pub file_size: u64,
    /// First token (inclusive) covered by the chunk.
    pub start_token: usize,
    /// Last token (exclusive) covered by the chunk.
    pub end_token: usize,
    /// SHA-256 of the chunk content, hex encoded.
    pub content_hash: String,
    /// RFC 3339 timestamp of the write.
    pub stored_at: String,
}

/// A stored chunk together with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreEntry {
    /// Chunk identifier, `{document_id}-{chunk_index}`.
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Chunk text.
    pub content: String,
    /// Chunk metadata.
    pub metadata: EntryMetadata,
}

/// One row per document in an owner's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Document identifier.
    pub document_id: String,
    /// File name supplied at upload time.
    pub original_name: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Size of the source file in bytes.
    pub file_size: u64,
    /// Number of stored chunks.
    pub chunk_count: usize,
    /// Timestamp of the most recent chunk write.
    pub stored_at: String,
}

/// Outcome of a [`VectorStore::store`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    /// Rows that did not exist before.
    pub inserted: usize,
    /// Rows overwritten in place.
    pub updated: usize,
    /// Rows removed because the new version of the document is shorter.
    pub removed_stale: usize,
}

impl StoreSummary {
    /// Rows written by the call.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// File-level facts copied onto every entry of a document.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    /// Document identifier.
    pub document_id: String,
    /// File name supplied at upload time.
    pub original_name: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Size of the source file in bytes.
    pub file_size: u64,
}

/// Storage backend for embedded chunks.
///
/// Every operation is filtered by `(agent_id, user_id)`; implementations must be safe for
/// concurrent calls, including racing stores of the same document.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert entries by id and drop rows of the same documents beyond the new chunk count.
    async fn store(
        &self,
        agent_id: &str,
        user_id: &str,
        entries: Vec<VectorStoreEntry>,
    ) -> Result<StoreSummary, VectorStoreError>;

    /// List one row per stored document.
    async fn list(&self, agent_id: &str, user_id: &str) -> Result<Vec<StoredFile>, VectorStoreError>;

    /// Fetch a document's entries ordered by chunk index.
    async fn get(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, VectorStoreError>;

    /// Remove every row of a document, returning how many were removed.
    async fn delete(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, VectorStoreError>;

    /// Check backend availability.
    async fn health(&self) -> Result<(), VectorStoreError> {
        Ok(())
    }

    /// Short backend name for diagnostics.
    fn backend_name(&self) -> &'static str;
}

/// Pair chunks with their vectors, producing entries ready for [`VectorStore::store`].
pub fn build_entries(
    info: &DocumentInfo,
    chunks: &[Chunk],
    vectors: Vec<Vec<f32>>,
) -> Vec<VectorStoreEntry> {
    let stored_at = current_timestamp_rfc3339();
    chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| VectorStoreEntry {
            id: chunk.id.clone(),
            vector,
            content: chunk.text.clone(),
            metadata: EntryMetadata {
                document_id: info.document_id.clone(),
                chunk_index: chunk.metadata.chunk_index,
                original_name: info.original_name.clone(),
                mime_type: info.mime_type.clone(),
                file_size: info.file_size,
                start_token: chunk.metadata.start_token,
                end_token: chunk.metadata.end_token,
                content_hash: compute_content_hash(&chunk.text),
                stored_at: stored_at.clone(),
            },
        })
        .collect()
}

/// Compute a deterministic SHA-256 hash for chunk content.
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current timestamp formatted as RFC 3339.
pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Collapse entries into per-document listing rows, sorted by document id.
pub(crate) fn summarize_files<'a, I>(entries: I) -> Vec<StoredFile>
where
    I: IntoIterator<Item = &'a EntryMetadata>,
{
    let mut files: BTreeMap<String, StoredFile> = BTreeMap::new();
    for metadata in entries {
        let row = files
            .entry(metadata.document_id.clone())
            .or_insert_with(|| StoredFile {
                document_id: metadata.document_id.clone(),
                original_name: metadata.original_name.clone(),
                mime_type: metadata.mime_type.clone(),
                file_size: metadata.file_size,
                chunk_count: 0,
                stored_at: metadata.stored_at.clone(),
            });
        row.chunk_count += 1;
        if metadata.stored_at > row.stored_at {
            row.stored_at = metadata.stored_at.clone();
            row.original_name = metadata.original_name.clone();
            row.mime_type = metadata.mime_type.clone();
            row.file_size = metadata.file_size;
        }
    }
    files.into_values().collect()
}

/// Highest chunk index per document in a batch; rows above it are stale.
pub(crate) fn last_indexes(entries: &[VectorStoreEntry]) -> BTreeMap<String, usize> {
    let mut last = BTreeMap::new();
    for entry in entries {
        let slot = last
            .entry(entry.metadata.document_id.clone())
            .or_insert(entry.metadata.chunk_index);
        *slot = (*slot).max(entry.metadata.chunk_index);
    }
    last
}

/// Structural checks shared by all backends.
pub(crate) fn validate_entries(
    entries: &[VectorStoreEntry],
    dimension: Option<usize>,
) -> Result<(), VectorStoreError> {
    let expected = dimension.or_else(|| entries.first().map(|entry| entry.vector.len()));
    for entry in entries {
        if entry.id.trim().is_empty() || entry.metadata.document_id.trim().is_empty() {
            return Err(VectorStoreError::InvalidEntry(
                "entry id and document id must not be empty".into(),
            ));
        }
        if let Some(expected) = expected
            && entry.vector.len() != expected
        {
            return Err(VectorStoreError::DimensionMismatch {
                expected,
                actual: entry.vector.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::processing::ChunkMetadata;

    pub(crate) fn entries(document_id: &str, count: usize, dimension: usize) -> Vec<VectorStoreEntry> {
        let chunks: Vec<Chunk> = (0..count)
            .map(|index| Chunk {
                id: format!("{document_id}-{index}"),
                text: format!("{document_id} chunk {index}"),
                metadata: ChunkMetadata {
                    chunk_index: index,
                    start_token: index * 3,
                    end_token: index * 3 + 3,
                },
            })
            .collect();
        let vectors = (0..count).map(|index| vec![index as f32; dimension]).collect();
        let info = DocumentInfo {
            document_id: document_id.to_string(),
            original_name: format!("{document_id}.txt"),
            mime_type: "text/plain".into(),
            file_size: 42,
        };
        build_entries(&info, &chunks, vectors)
    }
}
