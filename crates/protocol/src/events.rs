//! Event-name vocabulary shared by both channels.
//!
//! Request kinds pair with `.completed` / `.error` suffixes; the streaming
//! send additionally emits `.token` frames before its terminal frame.

/// Fire-and-forget metadata request, sent once per metadata-channel open.
pub const DOCUMENT_METADATA: &str = "document.metadata";

pub const CONVERSATION_LIST: &str = "conversation.list";
pub const CONVERSATION_MAIN_CREATE: &str = "conversation.main.create";
pub const CONVERSATION_CHUNK_CREATE: &str = "conversation.chunk.create";
pub const CONVERSATION_CHUNK_LIST: &str = "conversation.chunk.list";
pub const CONVERSATION_MESSAGES_GET: &str = "conversation.messages.get";
pub const CONVERSATION_MESSAGE_SEND: &str = "conversation.message.send";

/// Endpoint path of the document-metadata stream, joined with a document id.
pub const DOCUMENTS_STREAM_PATH: &str = "/documents/stream";
/// Endpoint path of the conversation stream, joined with a document id.
pub const CONVERSATIONS_STREAM_PATH: &str = "/conversations/stream";

/// Success-frame name for a request kind.
pub fn completed(event: &str) -> String {
    format!("{event}.completed")
}

/// Failure-frame name for a request kind. Also the dispatch target for
/// `{type, error}` envelopes redirected on the conversation channel.
pub fn error(event: &str) -> String {
    format!("{event}.error")
}

/// Token-frame name for a streaming request kind.
pub fn token(event: &str) -> String {
    format!("{event}.token")
}
