use std::collections::HashMap;
use std::sync::Mutex;

use snafu::OptionExt;

use super::error::{
    DuplicateMainConversationSnafu, StoreResult, StreamAlreadyActiveSnafu, StreamNotActiveSnafu,
    UnknownConversationSnafu,
};
use super::ids::{ChunkId, ConversationId};
use super::types::{
    ConversationKind, ConversationRecord, HighlightRecord, MessageRecord, StreamingSnapshot,
};

#[derive(Debug)]
struct ConversationEntry {
    record: ConversationRecord,
    messages: Vec<MessageRecord>,
}

#[derive(Debug, Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, ConversationEntry>,
    // Registration order; conversation listings follow it.
    order: Vec<ConversationId>,
    main_id: Option<ConversationId>,
    highlights: Vec<HighlightRecord>,
    streaming: HashMap<ConversationId, String>,
}

/// Single source of truth for client conversation state.
///
/// All mutations take one lock and run to completion, so no reader ever
/// observes a half-applied upsert. The store is session-scoped: `clear_all`
/// returns it to its initial empty state on sign-out or document switch.
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: Mutex<StoreInner>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert keyed by conversation id.
    ///
    /// Re-registering an id updates its kind and keeps its messages. A
    /// second *distinct* main conversation is rejected; one document session
    /// has exactly one.
    pub fn add_conversation(&self, record: ConversationRecord) -> StoreResult<()> {
        let mut inner = self.lock();

        if matches!(record.kind, ConversationKind::Main) {
            if let Some(existing) = &inner.main_id
                && *existing != record.id
            {
                return DuplicateMainConversationSnafu {
                    stage: "add-conversation",
                    existing: existing.to_string(),
                    attempted: record.id.to_string(),
                }
                .fail();
            }
            inner.main_id = Some(record.id.clone());
        }

        match inner.conversations.get_mut(&record.id) {
            Some(entry) => {
                entry.record = record;
            }
            None => {
                inner.order.push(record.id.clone());
                inner.conversations.insert(
                    record.id.clone(),
                    ConversationEntry {
                        record,
                        messages: Vec::new(),
                    },
                );
            }
        }

        Ok(())
    }

    pub fn main_conversation(&self) -> Option<ConversationRecord> {
        let inner = self.lock();
        let main_id = inner.main_id.as_ref()?;
        inner
            .conversations
            .get(main_id)
            .map(|entry| entry.record.clone())
    }

    pub fn get_conversation(&self, conversation_id: &ConversationId) -> Option<ConversationRecord> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|entry| entry.record.clone())
    }

    /// Chunk conversations registered for one chunk, in registration order.
    pub fn conversations_for_chunk(&self, chunk_id: &ChunkId) -> Vec<ConversationRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.conversations.get(id))
            .filter(|entry| entry.record.chunk_id() == Some(chunk_id))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Registers a highlight. The owning conversation must already exist.
    pub fn add_highlight(&self, highlight: HighlightRecord) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.conversations.contains_key(&highlight.conversation_id) {
            return UnknownConversationSnafu {
                stage: "add-highlight",
                conversation_id: highlight.conversation_id.to_string(),
            }
            .fail();
        }
        inner.highlights.push(highlight);
        Ok(())
    }

    /// Drops every highlight owned by `chunk_id`; returns how many went.
    pub fn remove_highlights_for_chunk(&self, chunk_id: &ChunkId) -> usize {
        let mut inner = self.lock();
        let before = inner.highlights.len();
        inner
            .highlights
            .retain(|highlight| highlight.chunk_id != *chunk_id);
        before - inner.highlights.len()
    }

    /// Highlights for one chunk ordered by start offset. Overlapping ranges
    /// are returned as stored; rendering nests them.
    pub fn get_highlights_for_chunk(&self, chunk_id: &ChunkId) -> Vec<HighlightRecord> {
        let inner = self.lock();
        let mut highlights = inner
            .highlights
            .iter()
            .filter(|highlight| highlight.chunk_id == *chunk_id)
            .cloned()
            .collect::<Vec<_>>();
        highlights.sort_by_key(|highlight| highlight.start_offset);
        highlights
    }

    /// Message history in append order; empty for unknown conversations.
    pub fn get_messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .conversations
            .get_mut(conversation_id)
            .context(UnknownConversationSnafu {
                stage: "append-message",
                conversation_id: conversation_id.to_string(),
            })?;
        entry.messages.push(message);
        Ok(())
    }

    /// Replaces the full history, used when replaying server-side messages.
    pub fn replace_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<MessageRecord>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .conversations
            .get_mut(conversation_id)
            .context(UnknownConversationSnafu {
                stage: "replace-messages",
                conversation_id: conversation_id.to_string(),
            })?;
        entry.messages = messages;
        Ok(())
    }

    /// Marks a conversation as streaming with empty accumulated content.
    pub fn begin_streaming(&self, conversation_id: &ConversationId) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.conversations.contains_key(conversation_id) {
            return UnknownConversationSnafu {
                stage: "begin-streaming",
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        }
        if inner.streaming.contains_key(conversation_id) {
            return StreamAlreadyActiveSnafu {
                stage: "begin-streaming",
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        }
        inner
            .streaming
            .insert(conversation_id.clone(), String::new());
        Ok(())
    }

    /// Appends one token delta and returns the accumulated content so far.
    pub fn apply_token(
        &self,
        conversation_id: &ConversationId,
        token: &str,
    ) -> StoreResult<String> {
        let mut inner = self.lock();
        let buffer = inner
            .streaming
            .get_mut(conversation_id)
            .context(StreamNotActiveSnafu {
                stage: "apply-token",
                conversation_id: conversation_id.to_string(),
            })?;
        buffer.push_str(token);
        Ok(buffer.clone())
    }

    /// Ends the stream and returns the accumulated content. The caller
    /// commits the terminal frame's message; the buffer is discarded either
    /// way so the streaming state reads idle immediately.
    pub fn finish_streaming(&self, conversation_id: &ConversationId) -> StoreResult<String> {
        let mut inner = self.lock();
        inner
            .streaming
            .remove(conversation_id)
            .context(StreamNotActiveSnafu {
                stage: "finish-streaming",
                conversation_id: conversation_id.to_string(),
            })
    }

    /// Clears streaming state after a failed exchange; no partial content is
    /// retained. Idle conversations are left untouched.
    pub fn fail_streaming(&self, conversation_id: &ConversationId) {
        self.lock().streaming.remove(conversation_id);
    }

    pub fn streaming_state(&self, conversation_id: &ConversationId) -> StreamingSnapshot {
        let inner = self.lock();
        match inner.streaming.get(conversation_id) {
            Some(buffer) => StreamingSnapshot {
                conversation_id: conversation_id.clone(),
                is_streaming: true,
                content: buffer.clone(),
            },
            None => StreamingSnapshot::idle(conversation_id.clone()),
        }
    }

    /// Full reset for sign-out or document switch.
    pub fn clear_all(&self) {
        let mut inner = self.lock();
        *inner = StoreInner::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned lock means a panic mid-mutation elsewhere; the store
        // itself never panics while holding the guard.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::types::Role;

    fn chunk_conversation(id: &str, chunk: &str, text: &str) -> ConversationRecord {
        ConversationRecord::chunk(ConversationId::new(id), ChunkId::new(chunk), text)
    }

    #[test]
    fn upsert_is_idempotent_and_keeps_messages() {
        let store = ConversationStore::new();
        let id = ConversationId::new("c1");
        store
            .add_conversation(ConversationRecord::main(id.clone()))
            .unwrap();
        store
            .append_message(
                &id,
                MessageRecord::new(MessageId::generate(), Role::User, "hi"),
            )
            .unwrap();

        store
            .add_conversation(ConversationRecord::main(id.clone()))
            .unwrap();

        assert_eq!(store.get_messages(&id).len(), 1);
    }

    #[test]
    fn second_distinct_main_is_rejected() {
        let store = ConversationStore::new();
        store
            .add_conversation(ConversationRecord::main(ConversationId::new("c1")))
            .unwrap();

        let error = store
            .add_conversation(ConversationRecord::main(ConversationId::new("c2")))
            .unwrap_err();
        assert!(error.to_string().contains("main conversation"));
    }

    #[test]
    fn highlight_requires_registered_conversation() {
        let store = ConversationStore::new();
        let orphan = HighlightRecord::new(
            "text",
            0,
            4,
            ConversationId::new("missing"),
            ChunkId::new("0"),
        );
        assert!(store.add_highlight(orphan).is_err());
    }

    #[test]
    fn highlights_sort_by_start_offset_per_chunk() {
        let store = ConversationStore::new();
        store
            .add_conversation(chunk_conversation("c1", "3", "alpha"))
            .unwrap();
        store
            .add_conversation(chunk_conversation("c2", "3", "beta"))
            .unwrap();

        let chunk = ChunkId::new("3");
        store
            .add_highlight(HighlightRecord::new(
                "beta",
                40,
                44,
                ConversationId::new("c2"),
                chunk.clone(),
            ))
            .unwrap();
        store
            .add_highlight(HighlightRecord::new(
                "alpha",
                10,
                15,
                ConversationId::new("c1"),
                chunk.clone(),
            ))
            .unwrap();

        let ordered = store.get_highlights_for_chunk(&chunk);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].text, "alpha");
        assert_eq!(ordered[1].text, "beta");
    }

    #[test]
    fn chunk_switch_cleanup_removes_only_that_chunk() {
        let store = ConversationStore::new();
        store
            .add_conversation(chunk_conversation("c1", "a", "one"))
            .unwrap();
        store
            .add_conversation(chunk_conversation("c2", "b", "two"))
            .unwrap();
        store
            .add_highlight(HighlightRecord::new(
                "one",
                0,
                3,
                ConversationId::new("c1"),
                ChunkId::new("a"),
            ))
            .unwrap();
        store
            .add_highlight(HighlightRecord::new(
                "two",
                0,
                3,
                ConversationId::new("c2"),
                ChunkId::new("b"),
            ))
            .unwrap();

        assert_eq!(store.remove_highlights_for_chunk(&ChunkId::new("a")), 1);
        assert!(store.get_highlights_for_chunk(&ChunkId::new("a")).is_empty());
        assert_eq!(store.get_highlights_for_chunk(&ChunkId::new("b")).len(), 1);
    }

    #[test]
    fn streaming_lifecycle_accumulates_then_resets() {
        let store = ConversationStore::new();
        let id = ConversationId::new("c1");
        store
            .add_conversation(ConversationRecord::main(id.clone()))
            .unwrap();

        store.begin_streaming(&id).unwrap();
        assert_eq!(store.apply_token(&id, "Hel").unwrap(), "Hel");
        assert_eq!(store.apply_token(&id, "lo").unwrap(), "Hello");
        assert!(store.streaming_state(&id).is_streaming);

        let accumulated = store.finish_streaming(&id).unwrap();
        assert_eq!(accumulated, "Hello");

        let snapshot = store.streaming_state(&id);
        assert!(!snapshot.is_streaming);
        assert!(snapshot.content.is_empty());
    }

    #[test]
    fn concurrent_streams_on_one_conversation_are_rejected() {
        let store = ConversationStore::new();
        let id = ConversationId::new("c1");
        store
            .add_conversation(ConversationRecord::main(id.clone()))
            .unwrap();

        store.begin_streaming(&id).unwrap();
        assert!(store.begin_streaming(&id).is_err());

        store.fail_streaming(&id);
        assert!(store.begin_streaming(&id).is_ok());
    }

    #[test]
    fn clear_all_resets_everything() {
        let store = ConversationStore::new();
        let id = ConversationId::new("c1");
        store
            .add_conversation(chunk_conversation("c1", "0", "text"))
            .unwrap();
        store
            .add_highlight(HighlightRecord::new(
                "text",
                1,
                5,
                id.clone(),
                ChunkId::new("0"),
            ))
            .unwrap();

        store.clear_all();

        assert!(store.get_conversation(&id).is_none());
        assert!(store.get_highlights_for_chunk(&ChunkId::new("0")).is_empty());
        assert!(store.main_conversation().is_none());
    }
}
