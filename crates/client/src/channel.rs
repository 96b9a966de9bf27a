//! Typed channel wrappers over the transport.
//!
//! Channel flavors are configuration of one `Connection` type: the metadata
//! channel carries an open announcement, the conversation channel redirects
//! `{type, error}` envelopes. Request methods translate between typed
//! payloads and the correlator's raw frames.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use margin_protocol::{
    ChunkConversations, ChunkCreateRequest, ChunkListRequest, ConversationCreated,
    ConversationList, ConversationSummary, HighlightRange, MessagesData, MessagesGetRequest,
    MetadataRequest, SendCompleted, SendMessageRequest, TokenData, events,
};
use margin_transport::{
    ChannelConfig, Connection, Correlator, HandlerId, OpenAnnouncement, StreamingExchange,
    TransportError,
};

use super::config::ClientConfig;

fn base_channel_config(config: &ClientConfig, endpoint_path: &str) -> ChannelConfig {
    ChannelConfig::new(config.ws_base_url.clone(), endpoint_path)
        .with_connect_timeout(config.connect_timeout())
        .with_reconnect_base_delay(config.reconnect_base_delay())
        .with_max_reconnect_attempts(config.max_reconnect_attempts)
}

/// Document-metadata channel: announces `document.metadata` after every
/// successful open, including reconnects.
pub struct DocumentChannel {
    connection: Connection,
}

impl DocumentChannel {
    pub fn open(config: &ClientConfig, document_id: &str) -> ChannelResult<Self> {
        let request = MetadataRequest {
            document_id: document_id.to_string(),
        };
        let payload = serde_json::to_value(&request).context(EncodePayloadSnafu {
            stage: "open-document-channel",
            event: events::DOCUMENT_METADATA.to_string(),
        })?;

        let channel_config = base_channel_config(config, events::DOCUMENTS_STREAM_PATH)
            .with_open_announcement(OpenAnnouncement::new(events::DOCUMENT_METADATA, payload));

        Ok(Self {
            connection: Connection::open(document_id, channel_config),
        })
    }

    /// Registers a handler for metadata frames pushed by the server.
    pub fn on_metadata(
        &self,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> HandlerId {
        self.connection
            .on_message(&events::completed(events::DOCUMENT_METADATA), handler)
    }

    pub async fn wait_for_connection(&self) -> Result<(), TransportError> {
        self.connection.wait_for_connection().await
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

/// Conversation channel: every request kind of the fixed vocabulary, typed.
pub struct ConversationChannel {
    correlator: Correlator,
}

impl ConversationChannel {
    pub fn open(config: &ClientConfig, document_id: &str) -> Self {
        let channel_config = base_channel_config(config, events::CONVERSATIONS_STREAM_PATH)
            .with_redirect_error_frames();
        Self {
            correlator: Correlator::new(Connection::open(document_id, channel_config)),
        }
    }

    pub async fn wait_for_connection(&self) -> ChannelResult<()> {
        self.correlator
            .connection()
            .wait_for_connection()
            .await
            .context(TransportSnafu {
                stage: "wait-for-connection",
            })
    }

    pub fn close(&self) {
        self.correlator.connection().close();
    }

    pub async fn list_conversations(
        &self,
    ) -> ChannelResult<BTreeMap<String, ConversationSummary>> {
        let data = self
            .request(events::CONVERSATION_LIST, Value::Object(Default::default()))
            .await?;
        let listed: ConversationList =
            decode(data, "list-conversations", events::CONVERSATION_LIST)?;
        Ok(listed.conversations)
    }

    pub async fn create_main_conversation(&self) -> ChannelResult<String> {
        let data = self
            .request(
                events::CONVERSATION_MAIN_CREATE,
                Value::Object(Default::default()),
            )
            .await?;
        let created: ConversationCreated =
            decode(data, "create-main-conversation", events::CONVERSATION_MAIN_CREATE)?;
        Ok(created.conversation_id)
    }

    pub async fn create_chunk_conversation(
        &self,
        chunk_id: &str,
        highlight_text: &str,
        highlight_range: Option<HighlightRange>,
    ) -> ChannelResult<String> {
        let request = ChunkCreateRequest {
            chunk_id: chunk_id.to_string(),
            highlight_text: highlight_text.to_string(),
            highlight_range,
        };
        let data = self
            .request(
                events::CONVERSATION_CHUNK_CREATE,
                encode(
                    &request,
                    "create-chunk-conversation",
                    events::CONVERSATION_CHUNK_CREATE,
                )?,
            )
            .await?;
        let created: ConversationCreated = decode(
            data,
            "create-chunk-conversation",
            events::CONVERSATION_CHUNK_CREATE,
        )?;
        Ok(created.conversation_id)
    }

    pub async fn chunk_conversations(
        &self,
        chunk_id: &str,
    ) -> ChannelResult<BTreeMap<String, ConversationSummary>> {
        let request = ChunkListRequest {
            chunk_id: chunk_id.to_string(),
        };
        let data = self
            .request(
                events::CONVERSATION_CHUNK_LIST,
                encode(&request, "chunk-conversations", events::CONVERSATION_CHUNK_LIST)?,
            )
            .await?;
        let listed: ChunkConversations =
            decode(data, "chunk-conversations", events::CONVERSATION_CHUNK_LIST)?;
        Ok(listed.conversations)
    }

    pub async fn messages(&self, conversation_id: &str) -> ChannelResult<MessagesData> {
        let request = MessagesGetRequest {
            conversation_id: conversation_id.to_string(),
        };
        let data = self
            .request(
                events::CONVERSATION_MESSAGES_GET,
                encode(&request, "get-messages", events::CONVERSATION_MESSAGES_GET)?,
            )
            .await?;
        decode(data, "get-messages", events::CONVERSATION_MESSAGES_GET)
    }

    /// Starts the streaming send; the session controller drives the
    /// returned exchange token by token.
    pub fn send_message_streaming(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> ChannelResult<StreamingExchange> {
        let request = SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        };
        let event = events::CONVERSATION_MESSAGE_SEND;
        self.correlator
            .send_streaming(
                event,
                encode(&request, "send-message", event)?,
                &events::token(event),
                &events::completed(event),
                &events::error(event),
            )
            .context(TransportSnafu {
                stage: "send-message",
            })
    }

    async fn request(&self, event: &'static str, payload: Value) -> ChannelResult<Value> {
        self.correlator
            .request(
                event,
                payload,
                &events::completed(event),
                &events::error(event),
            )
            .await
            .context(TransportSnafu { stage: "request" })
    }
}

/// Decodes a token frame's payload.
pub fn decode_token(payload: Value) -> ChannelResult<TokenData> {
    decode(payload, "decode-token", events::CONVERSATION_MESSAGE_SEND)
}

/// Decodes the streaming send's terminal completion payload.
pub fn decode_send_completed(payload: Value) -> ChannelResult<SendCompleted> {
    decode(
        payload,
        "decode-send-completed",
        events::CONVERSATION_MESSAGE_SEND,
    )
}

fn encode<T: serde::Serialize>(
    request: &T,
    stage: &'static str,
    event: &str,
) -> ChannelResult<Value> {
    serde_json::to_value(request).context(EncodePayloadSnafu {
        stage,
        event: event.to_string(),
    })
}

fn decode<T: DeserializeOwned>(
    payload: Value,
    stage: &'static str,
    event: &str,
) -> ChannelResult<T> {
    serde_json::from_value(payload).context(DecodePayloadSnafu {
        stage,
        event: event.to_string(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChannelError {
    #[snafu(display("transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("failed to encode request for '{event}'"))]
    EncodePayload {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
    #[snafu(display("response payload for '{event}' did not match the expected shape"))]
    DecodePayload {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
}

pub type ChannelResult<T> = Result<T, ChannelError>;
