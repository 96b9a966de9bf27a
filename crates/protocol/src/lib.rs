pub mod envelope;
pub mod events;
pub mod payload;

pub use envelope::Envelope;
pub use payload::{
    ChunkConversations, ChunkCreateRequest, ChunkListRequest, ConversationCreated,
    ConversationList, ConversationSummary, ErrorData, HighlightRange, MessagesData,
    MessagesGetRequest, MetadataRequest, SendCompleted, SendMessageRequest, TokenData,
    WireMessage,
};
