//! Core data types that flow through the ingestion pipeline.
//!
//! A [`Chunk`] is what a chunker produces and the publisher appends to the
//! stream. A [`StreamEntry`] is what a consumer reads back; it becomes an
//! [`IndexDocument`] once its fields are validated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Stream field carrying the chunk text.
pub const FIELD_PAGE_CONTENT: &str = "page_content";
/// Stream field carrying the JSON-serialized [`ChunkMetadata`].
pub const FIELD_METADATA: &str = "metadata";
/// Stream field carrying the publish time.
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Metadata attached to every chunk.
///
/// `user_id`, `file_path` and `mime_type` are set by the chunker;
/// `total_chunks`, `chunk_index` and `chunk_id` are stamped at publish time.
/// Unknown keys are kept in `extra` so they survive the round trip through
/// the stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn new(user_id: &str, file_path: &str, mime_type: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            file_path: file_path.to_string(),
            mime_type: mime_type.to_string(),
            source: Some(file_path.to_string()),
            ..Default::default()
        }
    }
}

/// A bounded unit of a file's content plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// A message read back from the stream: broker-assigned id plus raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Validate the entry's fields and build the document handed to the index.
    pub fn to_document(&self) -> Result<IndexDocument, MessageError> {
        let page_content = non_empty_field(&self.fields, FIELD_PAGE_CONTENT)?;
        let raw_metadata = non_empty_field(&self.fields, FIELD_METADATA)?;
        let metadata: ChunkMetadata = serde_json::from_str(raw_metadata)
            .map_err(|e| MessageError::InvalidMetadata(e.to_string()))?;

        Ok(IndexDocument {
            page_content: page_content.to_string(),
            metadata,
        })
    }
}

fn non_empty_field<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, MessageError> {
    match fields.get(name) {
        None => Err(MessageError::MissingField(name)),
        Some(value) if value.is_empty() => Err(MessageError::EmptyField(name)),
        Some(value) => Ok(value),
    }
}

/// Why a stream entry could not be turned into an [`IndexDocument`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("empty field `{0}`")]
    EmptyField(&'static str),
    #[error("metadata is not a valid JSON object: {0}")]
    InvalidMetadata(String),
}

/// The document shape submitted to the index client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub page_content: String,
    pub metadata: ChunkMetadata,
}

/// Media kinds the discovery worker knows how to chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Text,
    Image,
}

impl MediaKind {
    /// Classify a path by extension. `None` means unsupported.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(MediaKind::Text),
            "png" | "jpg" | "jpeg" => Some(MediaKind::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Image => "image",
        }
    }
}
