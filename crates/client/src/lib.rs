pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod session;

pub use api::{ApiClient, ApiError, DocumentUpload};
pub use auth::{AuthClient, AuthError, CredentialVault, Credentials, UserProfile};
pub use channel::{ChannelError, ConversationChannel, DocumentChannel};
pub use config::ClientConfig;
pub use session::{DocumentSession, SessionError, SessionPolicy};
