//! Mapping between vector store entries and Qdrant point payloads.

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::qdrant::types::QdrantError;
use crate::vector_store::{EntryMetadata, VectorStoreEntry};

/// Deterministic point id so re-ingesting a chunk overwrites the same point.
pub fn point_id(agent_id: &str, user_id: &str, chunk_id: &str) -> String {
    let name = format!("{agent_id}/{user_id}/{chunk_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Build the point body (`id`, `vector`, `payload`) for an entry.
pub(crate) fn build_point(agent_id: &str, user_id: &str, entry: &VectorStoreEntry) -> Value {
    let metadata = &entry.metadata;
    json!({
        "id": point_id(agent_id, user_id, &entry.id),
        "vector": entry.vector,
        "payload": {
            "chunk_id": entry.id,
            "agent_id": agent_id,
            "user_id": user_id,
            "document_id": metadata.document_id,
            "chunk_index": metadata.chunk_index,
            "content": entry.content,
            "original_name": metadata.original_name,
            "mime_type": metadata.mime_type,
            "file_size": metadata.file_size,
            "start_token": metadata.start_token,
            "end_token": metadata.end_token,
            "content_hash": metadata.content_hash,
            "stored_at": metadata.stored_at,
        }
    })
}

/// Decode a point payload and vector back into an entry.
pub(crate) fn entry_from_payload(
    payload: &Map<String, Value>,
    vector: Vec<f32>,
) -> Result<VectorStoreEntry, QdrantError> {
    Ok(VectorStoreEntry {
        id: string_field(payload, "chunk_id")?,
        vector,
        content: string_field(payload, "content")?,
        metadata: metadata_from_payload(payload)?,
    })
}

/// Decode the metadata portion of a point payload.
pub(crate) fn metadata_from_payload(
    payload: &Map<String, Value>,
) -> Result<EntryMetadata, QdrantError> {
    Ok(EntryMetadata {
        document_id: string_field(payload, "document_id")?,
        chunk_index: number_field(payload, "chunk_index")? as usize,
        original_name: string_field(payload, "original_name")?,
        mime_type: string_field(payload, "mime_type")?,
        file_size: number_field(payload, "file_size")?,
        start_token: number_field(payload, "start_token")? as usize,
        end_token: number_field(payload, "end_token")? as usize,
        content_hash: string_field(payload, "content_hash")?,
        stored_at: string_field(payload, "stored_at")?,
    })
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Result<String, QdrantError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| QdrantError::MalformedPayload(format!("missing string field '{key}'")))
}

fn number_field(payload: &Map<String, Value>, key: &str) -> Result<u64, QdrantError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| QdrantError::MalformedPayload(format!("missing numeric field '{key}'")))
}
