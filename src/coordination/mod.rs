//! Cross-worker coordination: KV backend, document locks, and job status records.

pub mod job_metadata;
pub mod kv;
pub mod mutex;

pub use job_metadata::{
    FileIngestionProgress, IngestionStatus, JobMetadataStore, MetadataError, StatusUpdate,
    WriteOutcome,
};
pub use kv::{InMemoryKeyValueStore, KeyValueError, KeyValueStore};
pub use mutex::{DistributedMutex, LockError, LockGuard, LockToken};
