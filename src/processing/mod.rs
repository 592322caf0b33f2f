//! Document processing pipeline: chunking, validation, the ingestion worker, and the job
//! processor that feeds it from the queues.

pub mod chunking;
pub mod processor;
pub mod retry;
pub mod types;
pub mod validation;
pub mod worker;

pub use chunking::{ChunkOptions, ChunkingStrategy, chunk};
pub use processor::{JobProcessor, ProcessorError, ProcessorSettings};
pub use retry::{Disposition, RetryPolicy};
pub use types::{
    Chunk, ChunkMetadata, ChunkingError, EmbeddingJobData, FailureKind, FileIngestionJobData,
    IngestionError, IngestionOptions, IngestionSummary,
};
pub use validation::ValidationPolicy;
pub use worker::{IngestionWorker, JobContext, TOTAL_STEPS, WorkerDeps, WorkerSettings};
