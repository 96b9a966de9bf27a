//! Typed payloads for the fixed request vocabulary.
//!
//! Field names mirror the wire exactly (snake_case JSON); anything the
//! server may omit is modeled as `Option` so a sparse frame never fails to
//! decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `document.metadata` request body, sent once per metadata-channel open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub document_id: String,
}

/// Character range of a highlight within its chunk's original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRange {
    pub start: usize,
    pub end: usize,
}

impl HighlightRange {
    /// A range is usable only when it spans at least one character.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

/// `conversation.chunk.create` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCreateRequest {
    pub chunk_id: String,
    pub highlight_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_range: Option<HighlightRange>,
}

/// `conversation.main.create.completed` / `conversation.chunk.create.completed` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: String,
}

/// Per-conversation summary as listed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_range: Option<HighlightRange>,
}

/// `conversation.list.completed` body: summaries keyed by conversation id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationList {
    #[serde(default)]
    pub conversations: BTreeMap<String, ConversationSummary>,
}

/// `conversation.chunk.list` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkListRequest {
    pub chunk_id: String,
}

/// `conversation.chunk.list.completed` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConversations {
    #[serde(default)]
    pub conversations: BTreeMap<String, ConversationSummary>,
}

/// `conversation.messages.get` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesGetRequest {
    pub conversation_id: String,
}

/// One stored message as the server replays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// `conversation.messages.get.completed` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesData {
    pub conversation_id: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

/// `conversation.message.send` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
}

/// `conversation.message.send.token` body: one streamed content delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub token: String,
}

/// `conversation.message.send.completed` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCompleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
    pub message: String,
}

/// Body of an `.error` frame (or of a redirected `{type, error}` envelope).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorData {
    /// Server-supplied message, or a generic fallback when absent.
    pub fn message_or(&self, fallback: &str) -> String {
        match &self.message {
            Some(message) if !message.trim().is_empty() => message.clone(),
            _ => fallback.to_string(),
        }
    }
}
