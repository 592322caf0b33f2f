use crate::processing::ChunkingStrategy;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Rusty Ingest worker process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Qdrant instance; the in-memory store is used when absent.
    pub qdrant_url: Option<String>,
    /// Name of the Qdrant collection holding document chunks.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Maximum number of texts sent to the provider per request.
    pub embedding_batch_size: usize,
    /// Base URL of the Ollama runtime, when that provider is selected.
    pub ollama_url: Option<String>,
    /// Default chunk size in whitespace tokens.
    pub chunk_size: usize,
    /// Default overlap between consecutive chunks, in tokens.
    pub chunk_overlap: usize,
    /// Default chunking strategy applied when a job does not pick one.
    pub chunking_strategy: ChunkingStrategy,
    /// Largest accepted upload, in bytes.
    pub max_file_size_bytes: u64,
    /// Concurrent consumers on the `fileIngestion` queue.
    pub concurrency_file_ingestion: usize,
    /// Concurrent consumers on the `embeddings` queue.
    pub concurrency_embeddings: usize,
    /// Retries granted to a job after its first attempt.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Lifetime of a document lock, in seconds.
    pub lock_ttl_secs: u64,
    /// Lifetime of job status records, in seconds.
    pub status_ttl_secs: u64,
    /// Lifetime of cached file listings, in seconds.
    pub listing_cache_ttl_secs: u64,
    /// SQLite database journalling queued jobs across restarts.
    pub queue_database_url: String,
    /// Upper bound on draining in-flight jobs during shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends for the ingestion pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Deterministic local hashing, for development and tests.
    Hash,
    /// Local Ollama runtime.
    Ollama,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            qdrant_url: load_env_optional("QDRANT_URL"),
            qdrant_collection_name: load_env_optional("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|| "rusty-ingest".to_string()),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_provider: load_env("EMBEDDING_PROVIDER")?.parse().map_err(|()| {
                ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string())
            })?,
            embedding_model: load_env("EMBEDDING_MODEL")?,
            embedding_dimension: load_env("EMBEDDING_DIMENSION")?.parse().map_err(|_| {
                ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string())
            })?,
            embedding_batch_size: load_parsed_or("EMBEDDING_BATCH_SIZE", 32)?,
            ollama_url: load_env_optional("OLLAMA_URL"),
            chunk_size: load_parsed_or("CHUNK_SIZE", 512)?,
            chunk_overlap: load_parsed_or("CHUNK_OVERLAP", 64)?,
            chunking_strategy: load_parsed_or("CHUNKING_STRATEGY", ChunkingStrategy::Whitespace)?,
            max_file_size_bytes: load_parsed_or("MAX_FILE_SIZE_BYTES", 10 * 1024 * 1024)?,
            concurrency_file_ingestion: load_parsed_or("CONCURRENCY_FILE_INGESTION", 2)?,
            concurrency_embeddings: load_parsed_or("CONCURRENCY_EMBEDDINGS", 2)?,
            max_retries: load_parsed_or("MAX_RETRIES", 3)?,
            retry_backoff_ms: load_parsed_or("RETRY_BACKOFF_MS", 1_000)?,
            lock_ttl_secs: load_parsed_or("LOCK_TTL_SECS", 300)?,
            status_ttl_secs: load_parsed_or("STATUS_TTL_SECS", 24 * 60 * 60)?,
            listing_cache_ttl_secs: load_parsed_or("LISTING_CACHE_TTL_SECS", 60)?,
            queue_database_url: load_env_optional("QUEUE_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://rusty-ingest-queue.db".to_string()),
            shutdown_timeout_secs: load_parsed_or("SHUTDOWN_TIMEOUT_SECS", 30)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };

        if config.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(ConfigError::InvalidValue("CHUNK_OVERLAP".into()));
        }
        Ok(config)
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_parsed_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = ?config.qdrant_url,
        collection = %config.qdrant_collection_name,
        server_port = ?config.server_port,
        queue_database = %config.queue_database_url,
        embedding_provider = ?config.embedding_provider,
        strategy = ?config.chunking_strategy,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_provider_parses_case_insensitively() {
        assert_eq!("Ollama".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Ollama));
        assert_eq!("hash".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Hash));
        assert!("openai".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn load_parsed_or_falls_back_to_default() {
        let value: usize = load_parsed_or("RUSTY_INGEST_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
