//! Upload policy re-checked by the worker before any lock or I/O.

use std::collections::BTreeSet;

use super::types::{FileIngestionJobData, IngestionError};

/// MIME types accepted for text ingestion.
pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "text/csv",
    "text/html",
    "text/xml",
    "text/yaml",
    "application/json",
    "application/xml",
    "application/x-yaml",
];

/// Limits applied to every ingestion job.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    allowed_mime_types: BTreeSet<String>,
    max_file_size: u64,
}

impl ValidationPolicy {
    /// Policy with the default allow-list and the given size ceiling.
    pub fn new(max_file_size: u64) -> Self {
        Self {
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|mime| mime.to_string())
                .collect(),
            max_file_size,
        }
    }

    /// Replace the allow-list.
    pub fn with_allowed_mime_types<I, S>(mut self, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_mime_types = mime_types
            .into_iter()
            .map(|mime| normalize_mime(mime.as_ref()))
            .collect();
        self
    }

    /// Largest accepted file, in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Check identifiers, MIME type, and size. Failures are never retryable.
    pub fn validate(&self, job: &FileIngestionJobData) -> Result<(), IngestionError> {
        for (field, value) in [
            ("documentId", &job.document_id),
            ("agentId", &job.agent_id),
            ("userId", &job.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(IngestionError::Validation(format!("{field} must not be empty")));
            }
        }

        let mime = normalize_mime(&job.mime_type);
        if !self.allowed_mime_types.contains(&mime) {
            return Err(IngestionError::Validation(format!(
                "unsupported mime type '{}'",
                job.mime_type
            )));
        }

        if job.size == 0 || job.content.is_empty() {
            return Err(IngestionError::Validation("file is empty".into()));
        }
        if job.size > self.max_file_size {
            return Err(IngestionError::Validation(format!(
                "file size {} exceeds limit of {} bytes",
                job.size, self.max_file_size
            )));
        }
        if job.content.len() as u64 != job.size {
            return Err(IngestionError::Validation(format!(
                "declared size {} does not match content length {}",
                job.size,
                job.content.len()
            )));
        }
        Ok(())
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

/// Lowercase and strip parameters such as `; charset=utf-8`.
fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_lowercase()
}
