use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, EmbeddingProvider};
use crate::processing::Chunk;

mod ollama;

pub use ollama::OllamaEmbeddingClient;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// HTTP layer failed before the provider answered.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider returned a different number of vectors than texts sent.
    #[error("Provider returned {actual} vectors for {expected} texts")]
    CountMismatch {
        /// Number of texts sent.
        expected: usize,
        /// Number of vectors received.
        actual: usize,
    },
    /// Provider returned a vector of the wrong dimension.
    #[error("Provider returned a {actual}-dimensional vector, expected {expected}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension received.
        actual: usize,
    },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied chunk of text.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Deterministic embedding client that hashes bytes into vector slots.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }
}

/// Splits chunk lists into provider-sized batches and checks what comes back.
///
/// Vectors are returned in chunk order. Any provider failure fails the whole call, so callers
/// never observe a partially embedded document.
#[derive(Clone)]
pub struct BatchingEmbeddingClient {
    inner: Arc<dyn EmbeddingClient>,
    batch_size: usize,
    dimension: usize,
}

impl BatchingEmbeddingClient {
    /// Wrap `inner`, sending at most `batch_size` texts per request.
    pub fn new(inner: Arc<dyn EmbeddingClient>, batch_size: usize, dimension: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            dimension,
        }
    }

    /// Configured vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed every chunk, one vector per chunk.
    pub async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            tracing::debug!(batch = batch_index, size = texts.len(), "Embedding batch");
            let embedded = self.inner.generate_embeddings(texts).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingClientError::CountMismatch {
                    expected: batch.len(),
                    actual: embedded.len(),
                });
            }
            if let Some(bad) = embedded.iter().find(|vector| vector.len() != self.dimension) {
                return Err(EmbeddingClientError::DimensionMismatch {
                    expected: self.dimension,
                    actual: bad.len(),
                });
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }
}

/// Build the embedding client selected by the configuration.
pub fn build_embedding_client(config: &Config) -> Result<BatchingEmbeddingClient, EmbeddingClientError> {
    let inner: Arc<dyn EmbeddingClient> = match config.embedding_provider {
        EmbeddingProvider::Hash => Arc::new(HashEmbeddingClient::new(config.embedding_dimension)),
        EmbeddingProvider::Ollama => {
            let base_url = config.ollama_url.as_deref().ok_or_else(|| {
                EmbeddingClientError::GenerationFailed("OLLAMA_URL is not set".to_string())
            })?;
            Arc::new(OllamaEmbeddingClient::new(base_url, &config.embedding_model)?)
        }
    };
    tracing::info!(
        provider = ?config.embedding_provider,
        model = %config.embedding_model,
        dimension = config.embedding_dimension,
        batch_size = config.embedding_batch_size,
        "Embedding client ready"
    );
    Ok(BatchingEmbeddingClient::new(
        inner,
        config.embedding_batch_size,
        config.embedding_dimension,
    ))
}
