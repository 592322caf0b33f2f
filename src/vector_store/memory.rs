use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    StoreSummary, StoredFile, VectorStore, VectorStoreEntry, VectorStoreError, last_indexes,
    summarize_files, validate_entries,
};

type Owner = (String, String);
type Documents = HashMap<String, BTreeMap<usize, VectorStoreEntry>>;

/// Process-local vector store.
///
/// A batch is validated before the write lock is taken and then applied under a single lock,
/// so readers never observe a half-written document.
#[derive(Default)]
pub struct InMemoryVectorStore {
    dimension: Option<usize>,
    owners: RwLock<HashMap<Owner, Documents>>,
}

impl InMemoryVectorStore {
    /// Store accepting vectors of any (consistent per batch) dimension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects vectors whose length differs from `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            owners: RwLock::default(),
        }
    }
}

fn owner(agent_id: &str, user_id: &str) -> Owner {
    (agent_id.to_string(), user_id.to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn store(
        &self,
        agent_id: &str,
        user_id: &str,
        entries: Vec<VectorStoreEntry>,
    ) -> Result<StoreSummary, VectorStoreError> {
        if entries.is_empty() {
            return Ok(StoreSummary::default());
        }
        validate_entries(&entries, self.dimension)?;
        let last = last_indexes(&entries);

        let mut owners = self.owners.write().await;
        let documents = owners.entry(owner(agent_id, user_id)).or_default();
        let mut summary = StoreSummary::default();

        for (document_id, last_index) in &last {
            if let Some(rows) = documents.get_mut(document_id) {
                let stale = rows.split_off(&(last_index + 1));
                summary.removed_stale += stale.len();
            }
        }

        for entry in entries {
            let rows = documents
                .entry(entry.metadata.document_id.clone())
                .or_default();
            match rows.insert(entry.metadata.chunk_index, entry) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }

        Ok(summary)
    }

    async fn list(&self, agent_id: &str, user_id: &str) -> Result<Vec<StoredFile>, VectorStoreError> {
        let owners = self.owners.read().await;
        let Some(documents) = owners.get(&owner(agent_id, user_id)) else {
            return Ok(Vec::new());
        };
        Ok(summarize_files(
            documents
                .values()
                .flat_map(|rows| rows.values().map(|entry| &entry.metadata)),
        ))
    }

    async fn get(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, VectorStoreError> {
        let owners = self.owners.read().await;
        owners
            .get(&owner(agent_id, user_id))
            .and_then(|documents| documents.get(document_id))
            .filter(|rows| !rows.is_empty())
            .map(|rows| rows.values().cloned().collect())
            .ok_or_else(|| VectorStoreError::NotFound {
                document_id: document_id.to_string(),
            })
    }

    async fn delete(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, VectorStoreError> {
        let mut owners = self.owners.write().await;
        owners
            .get_mut(&owner(agent_id, user_id))
            .and_then(|documents| documents.remove(document_id))
            .map(|rows| rows.len())
            .filter(|removed| *removed > 0)
            .ok_or_else(|| VectorStoreError::NotFound {
                document_id: document_id.to_string(),
            })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
