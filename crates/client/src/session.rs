//! Per-document conversation session controller.
//!
//! Owns the lifecycle of one open document: discover-or-create the main
//! conversation exactly once, keep the store in sync with the visible
//! chunk's conversations and highlights, create chunk conversations on
//! demand, and drive streaming message sends.

use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::Mutex;

use margin_protocol::{ConversationSummary, HighlightRange, WireMessage};
use margin_store::{
    ChunkId, ConversationId, ConversationRecord, ConversationStore, HighlightRecord, MessageId,
    MessageRecord, Role, StoreError, types::current_unix_timestamp_seconds,
};
use margin_transport::StreamEvent;

use super::channel::{self, ChannelError, ConversationChannel};
use super::config::ClientConfig;

/// Session-level timing policy; distinct from transport timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub create_conversation_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            create_conversation_timeout: Duration::from_millis(10_000),
        }
    }
}

impl SessionPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            create_conversation_timeout: config.create_conversation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Uninitialized,
    Discovering,
    Ready,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    main_conversation_id: Option<ConversationId>,
    active_chunk: Option<ChunkId>,
}

pub struct DocumentSession {
    store: Arc<ConversationStore>,
    channel: ConversationChannel,
    policy: SessionPolicy,
    // One lock serializes every lifecycle operation; store mutations stay
    // ordered exactly as the operations were issued.
    state: Mutex<SessionState>,
}

impl DocumentSession {
    pub fn new(
        store: Arc<ConversationStore>,
        channel: ConversationChannel,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            channel,
            policy,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                main_conversation_id: None,
                active_chunk: None,
            }),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub async fn main_conversation_id(&self) -> Option<ConversationId> {
        self.state.lock().await.main_conversation_id.clone()
    }

    pub async fn active_chunk(&self) -> Option<ChunkId> {
        self.state.lock().await.active_chunk.clone()
    }

    /// Discovers or creates the main conversation, then loads the initial
    /// chunk's conversations. Runs exactly once per session; re-invocation
    /// while discovering or after completion is a no-op.
    pub async fn initialize(&self, initial_chunk: ChunkId) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        if state.phase != SessionPhase::Uninitialized {
            tracing::debug!(phase = ?state.phase, "initialize already ran; ignoring");
            return Ok(());
        }
        state.phase = SessionPhase::Discovering;

        self.channel
            .wait_for_connection()
            .await
            .context(ChannelSnafu {
                stage: "initialize-wait",
            })?;

        let listed = self
            .channel
            .list_conversations()
            .await
            .context(ChannelSnafu {
                stage: "list-conversations",
            })?;

        let main_id = match listed.into_iter().next() {
            Some((conversation_id, _summary)) => {
                tracing::info!(conversation_id = %conversation_id, "adopting existing main conversation");
                let main_id = ConversationId::new(conversation_id);
                self.store
                    .add_conversation(ConversationRecord::main(main_id.clone()))
                    .context(StoreSnafu {
                        stage: "register-main",
                    })?;
                self.load_message_history(&main_id).await?;
                main_id
            }
            None => {
                tracing::info!("no existing conversations; creating main conversation");
                let created = tokio::time::timeout(
                    self.policy.create_conversation_timeout,
                    self.channel.create_main_conversation(),
                )
                .await
                .map_err(|_elapsed| timed_out("create-main-conversation", &self.policy))?
                .context(ChannelSnafu {
                    stage: "create-main-conversation",
                })?;

                let main_id = ConversationId::new(created);
                self.store
                    .add_conversation(ConversationRecord::main(main_id.clone()))
                    .context(StoreSnafu {
                        stage: "register-main",
                    })?;
                main_id
            }
        };

        state.main_conversation_id = Some(main_id);
        state.active_chunk = Some(initial_chunk.clone());
        state.phase = SessionPhase::Ready;

        self.store.remove_highlights_for_chunk(&initial_chunk);
        self.load_chunk_conversations(&initial_chunk).await
    }

    /// Re-enters the ready state for a new visible chunk: the previous
    /// chunk's highlights go away, the new chunk's conversations load.
    pub async fn set_visible_chunk(&self, chunk_id: ChunkId) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        ensure!(
            state.phase == SessionPhase::Ready,
            NotReadySnafu {
                stage: "set-visible-chunk",
            }
        );

        let previous = state.active_chunk.replace(chunk_id.clone());
        if let Some(previous) = previous {
            let removed = self.store.remove_highlights_for_chunk(&previous);
            tracing::debug!(chunk_id = %previous, removed, "cleared highlights for previous chunk");
        }
        // Re-entering a chunk reloads it; drop any stale copies first.
        self.store.remove_highlights_for_chunk(&chunk_id);

        self.load_chunk_conversations(&chunk_id).await
    }

    /// Creates a highlight-scoped conversation server-side and registers it
    /// (and its highlight, when a valid range is supplied) in the store.
    /// The caller is expected to switch its active view to the returned id.
    pub async fn create_chunk_conversation(
        &self,
        highlight_text: &str,
        chunk_id: ChunkId,
        range: Option<HighlightRange>,
    ) -> SessionResult<ConversationId> {
        ensure!(
            !highlight_text.trim().is_empty(),
            EmptyHighlightSnafu {
                stage: "create-chunk-conversation",
            }
        );
        {
            let state = self.state.lock().await;
            ensure!(
                state.phase == SessionPhase::Ready,
                NotReadySnafu {
                    stage: "create-chunk-conversation",
                }
            );
        }

        let created = tokio::time::timeout(
            self.policy.create_conversation_timeout,
            self.channel
                .create_chunk_conversation(chunk_id.as_str(), highlight_text, range),
        )
        .await
        .map_err(|_elapsed| timed_out("create-chunk-conversation", &self.policy))?
        .context(ChannelSnafu {
            stage: "create-chunk-conversation",
        })?;

        let conversation_id = ConversationId::new(created);
        self.store
            .add_conversation(ConversationRecord::chunk(
                conversation_id.clone(),
                chunk_id.clone(),
                highlight_text,
            ))
            .context(StoreSnafu {
                stage: "register-chunk-conversation",
            })?;

        if let Some(range) = range
            && range.is_valid()
        {
            self.store
                .add_highlight(HighlightRecord::new(
                    highlight_text,
                    range.start,
                    range.end,
                    conversation_id.clone(),
                    chunk_id,
                ))
                .context(StoreSnafu {
                    stage: "register-highlight",
                })?;
        }

        tracing::info!(conversation_id = %conversation_id, "chunk conversation created");
        Ok(conversation_id)
    }

    /// Sends one user message and drives the streaming reply.
    ///
    /// Every token updates the conversation's streaming state; completion
    /// commits exactly one assistant message and clears it; failure clears
    /// it with no partial content retained.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> SessionResult<MessageRecord> {
        self.store
            .append_message(
                conversation_id,
                MessageRecord::new(MessageId::generate(), Role::User, content),
            )
            .context(StoreSnafu {
                stage: "append-user-message",
            })?;
        self.store
            .begin_streaming(conversation_id)
            .context(StoreSnafu {
                stage: "begin-streaming",
            })?;

        match self.drive_streaming(conversation_id, content).await {
            Ok(assistant) => Ok(assistant),
            Err(error) => {
                self.store.fail_streaming(conversation_id);
                Err(error)
            }
        }
    }

    async fn drive_streaming(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> SessionResult<MessageRecord> {
        let mut exchange = self
            .channel
            .send_message_streaming(conversation_id.as_str(), content)
            .context(ChannelSnafu {
                stage: "send-message",
            })?;

        loop {
            match exchange.next_event().await {
                Some(StreamEvent::Token(payload)) => {
                    let token = channel::decode_token(payload).context(ChannelSnafu {
                        stage: "decode-token",
                    })?;
                    self.store
                        .apply_token(conversation_id, &token.token)
                        .context(StoreSnafu {
                            stage: "apply-token",
                        })?;
                }
                Some(StreamEvent::Completed(payload)) => {
                    let completed =
                        channel::decode_send_completed(payload).context(ChannelSnafu {
                            stage: "decode-completion",
                        })?;
                    self.store
                        .finish_streaming(conversation_id)
                        .context(StoreSnafu {
                            stage: "finish-streaming",
                        })?;

                    let assistant = MessageRecord {
                        id: completed
                            .user_message_id
                            .map(MessageId::new)
                            .unwrap_or_else(MessageId::generate),
                        role: Role::Assistant,
                        content: completed.message,
                        created_at_unix_seconds: current_unix_timestamp_seconds(),
                    };
                    self.store
                        .append_message(conversation_id, assistant.clone())
                        .context(StoreSnafu {
                            stage: "commit-assistant-message",
                        })?;
                    return Ok(assistant);
                }
                Some(StreamEvent::Failed(source)) => {
                    return Err(SessionError::Streaming {
                        stage: "stream-error",
                        message: source.to_string(),
                    });
                }
                None => {
                    return StreamInterruptedSnafu {
                        stage: "stream-ended",
                    }
                    .fail();
                }
            }
        }
    }

    /// Loads every chunk conversation for `chunk_id`, silently skipping the
    /// ones with empty highlight text, and replays each one's history.
    async fn load_chunk_conversations(&self, chunk_id: &ChunkId) -> SessionResult<()> {
        let listed = self
            .channel
            .chunk_conversations(chunk_id.as_str())
            .await
            .context(ChannelSnafu {
                stage: "chunk-conversations",
            })?;

        for (raw_id, summary) in listed {
            let Some(prepared) = prepare_chunk_conversation(raw_id, summary, chunk_id) else {
                continue;
            };

            self.store
                .add_conversation(prepared.conversation)
                .context(StoreSnafu {
                    stage: "register-chunk-conversation",
                })?;
            if let Some(highlight) = prepared.highlight {
                self.store.add_highlight(highlight).context(StoreSnafu {
                    stage: "register-highlight",
                })?;
            }
            self.load_message_history(&prepared.conversation_id).await?;
        }

        Ok(())
    }

    async fn load_message_history(&self, conversation_id: &ConversationId) -> SessionResult<()> {
        let data = self
            .channel
            .messages(conversation_id.as_str())
            .await
            .context(ChannelSnafu {
                stage: "get-messages",
            })?;
        let messages = data
            .messages
            .into_iter()
            .map(message_from_wire)
            .collect::<Vec<_>>();
        self.store
            .replace_messages(conversation_id, messages)
            .context(StoreSnafu {
                stage: "store-message-history",
            })
    }
}

struct PreparedChunkConversation {
    conversation_id: ConversationId,
    conversation: ConversationRecord,
    highlight: Option<HighlightRecord>,
}

/// Turns one listed summary into store records, or `None` when the
/// conversation must not be surfaced (empty highlight text).
fn prepare_chunk_conversation(
    raw_id: String,
    summary: ConversationSummary,
    requested_chunk: &ChunkId,
) -> Option<PreparedChunkConversation> {
    let highlight_text = summary.highlight_text.unwrap_or_default();
    if highlight_text.trim().is_empty() {
        tracing::debug!(conversation_id = %raw_id, "skipping chunk conversation with empty highlight");
        return None;
    }

    let conversation_id = ConversationId::new(raw_id);
    let owner_chunk = summary
        .chunk_id
        .map(ChunkId::new)
        .unwrap_or_else(|| requested_chunk.clone());

    let highlight = summary
        .highlight_range
        .filter(HighlightRange::is_valid)
        .map(|range| {
            HighlightRecord::new(
                highlight_text.clone(),
                range.start,
                range.end,
                conversation_id.clone(),
                owner_chunk.clone(),
            )
        });

    Some(PreparedChunkConversation {
        conversation: ConversationRecord::chunk(
            conversation_id.clone(),
            owner_chunk,
            highlight_text,
        ),
        conversation_id,
        highlight,
    })
}

fn message_from_wire(wire: WireMessage) -> MessageRecord {
    MessageRecord {
        id: wire.id.map(MessageId::new).unwrap_or_else(MessageId::generate),
        role: Role::from_wire(&wire.role),
        content: wire.content,
        created_at_unix_seconds: wire
            .created_at
            .unwrap_or_else(current_unix_timestamp_seconds),
    }
}

fn timed_out(stage: &'static str, policy: &SessionPolicy) -> SessionError {
    SessionError::CreateConversationTimedOut {
        stage,
        timeout_ms: policy.create_conversation_timeout.as_millis() as u64,
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("channel operation failed on `{stage}`: {source}"))]
    Channel {
        stage: &'static str,
        source: ChannelError,
    },
    #[snafu(display("store operation failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("conversation creation timed out after {timeout_ms} ms"))]
    CreateConversationTimedOut {
        stage: &'static str,
        timeout_ms: u64,
    },
    #[snafu(display("session is not ready on `{stage}`"))]
    NotReady { stage: &'static str },
    #[snafu(display("highlight text must not be empty"))]
    EmptyHighlight { stage: &'static str },
    #[snafu(display("streaming exchange failed: {message}"))]
    Streaming {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("streaming exchange ended without a terminal frame"))]
    StreamInterrupted { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use margin_protocol::ConversationSummary;

    #[test]
    fn empty_highlight_conversations_are_never_prepared() {
        let summary = ConversationSummary {
            chunk_id: Some("3".to_string()),
            highlight_text: Some("   ".to_string()),
            highlight_range: None,
        };
        assert!(prepare_chunk_conversation("c1".to_string(), summary, &ChunkId::new("3")).is_none());
    }

    #[test]
    fn invalid_ranges_register_the_conversation_without_a_highlight() {
        let summary = ConversationSummary {
            chunk_id: Some("3".to_string()),
            highlight_text: Some("hello".to_string()),
            highlight_range: Some(HighlightRange { start: 7, end: 7 }),
        };
        let prepared =
            prepare_chunk_conversation("c1".to_string(), summary, &ChunkId::new("3")).unwrap();
        assert!(prepared.highlight.is_none());
        assert_eq!(prepared.conversation_id.as_str(), "c1");
    }

    #[test]
    fn wire_messages_fill_missing_ids_and_timestamps() {
        let record = message_from_wire(WireMessage {
            id: None,
            role: "assistant".to_string(),
            content: "hi".to_string(),
            created_at: None,
        });
        assert_eq!(record.role, Role::Assistant);
        assert!(!record.id.as_str().is_empty());
        assert!(record.created_at_unix_seconds > 0);
    }
}
