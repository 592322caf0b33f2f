//! Core data types and error definitions for the ingestion pipeline.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::EmbeddingClientError;
use crate::vector_store::VectorStoreError;

use super::chunking::{ChunkOptions, ChunkingStrategy};

/// Errors produced while turning raw text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Ingestion configured an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Overlap would stop the window from advancing.
    #[error("overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    OverlapTooLarge {
        /// Requested overlap in tokens.
        overlap: usize,
        /// Requested chunk size in tokens.
        chunk_size: usize,
    },
    /// Strategy name did not match a known algorithm.
    #[error("unknown chunking strategy '{0}'")]
    UnknownStrategy(String),
}

/// Positional metadata attached to each chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Zero-based position of the chunk within its document.
    pub chunk_index: usize,
    /// First token (inclusive) of the chunk in the original document.
    pub start_token: usize,
    /// Last token (exclusive) of the chunk in the original document.
    pub end_token: usize,
}

/// Contiguous, bounded slice of a document's token stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier `{document_id}-{chunk_index}`.
    pub id: String,
    /// Tokens of the chunk joined by single spaces.
    pub text: String,
    /// Positional metadata.
    pub metadata: ChunkMetadata,
}

/// Per-job ingestion switches and chunking overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionOptions {
    /// Chunk size override; the worker default applies when absent.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Overlap override; the worker default applies when absent.
    #[serde(default)]
    pub overlap: Option<usize>,
    /// Strategy override; the worker default applies when absent.
    #[serde(default)]
    pub strategy: Option<ChunkingStrategy>,
    /// Embed inline. When `false`, chunks are handed to the `embeddings` queue.
    #[serde(default = "default_true")]
    pub generate_embeddings: bool,
    /// Persist chunks and vectors. When `false`, the job is a dry run.
    #[serde(default = "default_true")]
    pub store_vectors: bool,
}

fn default_true() -> bool {
    true
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            overlap: None,
            strategy: None,
            generate_embeddings: true,
            store_vectors: true,
        }
    }
}

impl IngestionOptions {
    /// Merge per-job overrides onto the worker defaults.
    pub fn resolve(&self, defaults: &ChunkOptions) -> ChunkOptions {
        ChunkOptions {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            overlap: self.overlap.unwrap_or(defaults.overlap),
            strategy: self.strategy.unwrap_or(defaults.strategy),
        }
    }
}

/// Immutable payload of a `fileIngestion` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIngestionJobData {
    /// Stable document key, also used for locking and deduplication.
    pub document_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Owning user.
    pub user_id: String,
    /// File name supplied at upload time.
    pub original_name: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Raw file bytes.
    pub content: Vec<u8>,
    /// Declared size in bytes.
    pub size: u64,
    /// Chunking and persistence options.
    #[serde(default)]
    pub options: IngestionOptions,
}

impl FileIngestionJobData {
    /// Build a payload with default options; `size` is taken from the content.
    pub fn new(
        document_id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        let content = content.into();
        Self {
            document_id: document_id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            size: content.len() as u64,
            content,
            options: IngestionOptions::default(),
        }
    }

    /// Replace the ingestion options.
    pub fn with_options(mut self, options: IngestionOptions) -> Self {
        self.options = options;
        self
    }

    /// Content decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Payload of an `embeddings` job: chunks produced by a deferred ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJobData {
    /// Ingestion job whose progress record this job completes.
    pub ingestion_job_id: String,
    /// Document the chunks belong to.
    pub document_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Owning user.
    pub user_id: String,
    /// File name supplied at upload time.
    pub original_name: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Chunks awaiting embeddings, in document order.
    pub chunks: Vec<Chunk>,
}

/// How a pipeline failure should be treated by the job processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad input or configuration; never retried.
    Validation,
    /// Another worker holds the document lock; requeue later.
    Contention,
    /// Provider or storage hiccup; retried with backoff.
    Transient,
    /// Internal invariant broken; never retried.
    Corruption,
}

/// Errors raised while ingesting a single document.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Input or configuration rejected.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Document lock is held by another worker.
    #[error("document '{document_id}' is being processed by another worker")]
    Contention {
        /// Locked document.
        document_id: String,
    },
    /// External dependency failed in a way that may succeed later.
    #[error("{stage} step failed: {message}")]
    Transient {
        /// Pipeline step that failed.
        stage: &'static str,
        /// Provider or backend message.
        message: String,
    },
    /// Chunks and vectors no longer pair up.
    #[error("chunk/vector count mismatch: {chunks} chunks, {vectors} vectors")]
    Corruption {
        /// Number of chunks sent for embedding.
        chunks: usize,
        /// Number of vectors returned.
        vectors: usize,
    },
}

impl IngestionError {
    /// Classify the error for retry decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::Contention { .. } => FailureKind::Contention,
            Self::Transient { .. } => FailureKind::Transient,
            Self::Corruption { .. } => FailureKind::Corruption,
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transient)
    }

    pub(crate) fn from_embedding(error: EmbeddingClientError) -> Self {
        match error {
            EmbeddingClientError::CountMismatch { expected, actual } => Self::Corruption {
                chunks: expected,
                vectors: actual,
            },
            mismatch @ EmbeddingClientError::DimensionMismatch { .. } => {
                Self::Validation(mismatch.to_string())
            }
            other => Self::Transient {
                stage: "embed",
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn from_store(error: VectorStoreError) -> Self {
        Self::Transient {
            stage: "store",
            message: error.to_string(),
        }
    }
}

impl From<ChunkingError> for IngestionError {
    fn from(error: ChunkingError) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Summary of a finished ingestion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    /// Document that was processed.
    pub document_id: String,
    /// Number of chunks produced.
    pub chunk_count: usize,
    /// Number of vector rows written.
    pub stored: usize,
    /// `true` when embedding was handed off to the `embeddings` queue.
    pub deferred: bool,
}
