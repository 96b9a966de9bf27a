use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::{ChunkId, ConversationId, HighlightId, MessageId};

/// Chat speaker role, decoupled from the wire's string encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Unknown roles map to `System` so replayed history never drops a turn.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::System,
        }
    }
}

/// One committed message. Streaming output never lives here; it accumulates
/// in the conversation's streaming state until the terminal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_unix_seconds: u64,
}

impl MessageRecord {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at_unix_seconds: current_unix_timestamp_seconds(),
        }
    }
}

/// Distinguishes the single whole-document conversation from
/// highlight-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    Main,
    Chunk {
        chunk_id: ChunkId,
        highlight_text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub kind: ConversationKind,
}

impl ConversationRecord {
    pub fn main(id: ConversationId) -> Self {
        Self {
            id,
            kind: ConversationKind::Main,
        }
    }

    pub fn chunk(id: ConversationId, chunk_id: ChunkId, highlight_text: impl Into<String>) -> Self {
        Self {
            id,
            kind: ConversationKind::Chunk {
                chunk_id,
                highlight_text: highlight_text.into(),
            },
        }
    }

    pub fn chunk_id(&self) -> Option<&ChunkId> {
        match &self.kind {
            ConversationKind::Main => None,
            ConversationKind::Chunk { chunk_id, .. } => Some(chunk_id),
        }
    }
}

/// A user-selected character range within one chunk, linked to exactly one
/// chunk conversation. Offsets index the chunk's original content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightRecord {
    pub id: HighlightId,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub conversation_id: ConversationId,
    pub chunk_id: ChunkId,
}

impl HighlightRecord {
    pub fn new(
        text: impl Into<String>,
        start_offset: usize,
        end_offset: usize,
        conversation_id: ConversationId,
        chunk_id: ChunkId,
    ) -> Self {
        Self {
            id: HighlightId::generate(),
            text: text.into(),
            start_offset,
            end_offset,
            conversation_id,
            chunk_id,
        }
    }
}

/// Read-only view of one conversation's in-flight assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSnapshot {
    pub conversation_id: ConversationId,
    pub is_streaming: bool,
    pub content: String,
}

impl StreamingSnapshot {
    pub fn idle(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            is_streaming: false,
            content: String::new(),
        }
    }
}

pub fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
