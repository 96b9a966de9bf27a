pub mod error;
pub mod ids;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use ids::{ChunkId, ConversationId, HighlightId, MessageId};
pub use store::ConversationStore;
pub use types::{
    ConversationKind, ConversationRecord, HighlightRecord, MessageRecord, Role, StreamingSnapshot,
};
