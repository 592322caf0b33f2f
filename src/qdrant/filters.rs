//! Filter builders scoping Qdrant queries to an owner and document.

use serde_json::{Value, json};

fn keyword(key: &str, value: &str) -> Value {
    json!({
        "key": key,
        "match": { "value": value }
    })
}

/// Every point owned by `(agent_id, user_id)`.
pub fn owner_filter(agent_id: &str, user_id: &str) -> Value {
    json!({
        "must": [keyword("agent_id", agent_id), keyword("user_id", user_id)]
    })
}

/// Every point of one document under an owner.
pub fn document_filter(agent_id: &str, user_id: &str, document_id: &str) -> Value {
    json!({
        "must": [
            keyword("agent_id", agent_id),
            keyword("user_id", user_id),
            keyword("document_id", document_id)
        ]
    })
}

/// Points of a document whose `chunk_index` is greater than `last_index`.
pub fn stale_tail_filter(agent_id: &str, user_id: &str, document_id: &str, last_index: usize) -> Value {
    json!({
        "must": [
            keyword("agent_id", agent_id),
            keyword("user_id", user_id),
            keyword("document_id", document_id),
            {
                "key": "chunk_index",
                "range": { "gt": last_index }
            }
        ]
    })
}
