use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("conversation '{conversation_id}' is not registered"))]
    UnknownConversation {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display(
        "a main conversation '{existing}' already exists; refusing to register '{attempted}'"
    ))]
    DuplicateMainConversation {
        stage: &'static str,
        existing: String,
        attempted: String,
    },
    #[snafu(display("conversation '{conversation_id}' is already streaming"))]
    StreamAlreadyActive {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("conversation '{conversation_id}' has no active stream"))]
    StreamNotActive {
        stage: &'static str,
        conversation_id: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
