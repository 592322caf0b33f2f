use std::env;

use rusty_ingest::embedding::{EmbeddingClient, OllamaEmbeddingClient};
use rusty_ingest::qdrant::QdrantVectorStore;
use rusty_ingest::vector_store::VectorStore;

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::test]
#[ignore = "Requires live Qdrant"]
async fn live_qdrant_collection_is_ready() {
    let store = QdrantVectorStore::new(
        &env_or("QDRANT_URL", "http://127.0.0.1:6333"),
        env::var("QDRANT_API_KEY").ok(),
        &env_or("QDRANT_COLLECTION_NAME", "rusty-ingest-live"),
        env_or("EMBEDDING_DIMENSION", "768")
            .parse()
            .expect("EMBEDDING_DIMENSION must be a number"),
    )
    .expect("valid Qdrant URL");
    store.initialize().await.expect("collection initializes");
    store.health().await.expect("Qdrant should be reachable");
    assert!(
        store
            .list("live-agent", "live-user")
            .await
            .expect("listing succeeds")
            .iter()
            .all(|file| file.chunk_count > 0)
    );
}

#[tokio::test]
#[ignore = "Requires live Ollama embeddings"]
async fn live_ollama_embedding_roundtrip() {
    let client = OllamaEmbeddingClient::new(
        &env_or("OLLAMA_URL", "http://127.0.0.1:11434"),
        &env_or("EMBEDDING_MODEL", "nomic-embed-text"),
    )
    .expect("valid Ollama URL");
    let vectors = client
        .generate_embeddings(vec!["rusty-ingest live embedding".to_string()])
        .await
        .expect("failed to request embeddings from provider");
    assert_eq!(vectors.len(), 1, "expected embedding per input chunk");
    let dimension: usize = env_or("EMBEDDING_DIMENSION", "768")
        .parse()
        .expect("EMBEDDING_DIMENSION must be a number");
    assert_eq!(vectors[0].len(), dimension, "embedding dimension mismatch");
}
