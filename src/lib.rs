#![deny(missing_docs)]

//! Core library for Rusty Ingest: a queued document ingestion pipeline that chunks files,
//! generates embeddings, and persists them to a vector store.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Distributed locking and per-document status records.
pub mod coordination;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Structured logging and tracing setup.
pub mod logging;
/// Worker manager wiring every pipeline component together.
pub mod manager;
/// Ingestion counters.
pub mod metrics;
/// Chunking, validation, and job execution.
pub mod processing;
/// Qdrant vector store integration.
pub mod qdrant;
/// In-process job queues.
pub mod queue;
/// Vector store abstraction, in-memory backend, and listing cache.
pub mod vector_store;
