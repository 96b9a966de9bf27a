//! Interactive command-line client.
//!
//! `margin upload <file>` uploads a document and prints its id.
//! `margin chat <document-id>` opens both channels for the document and
//! drops into a line-based chat with the main conversation:
//!
//!   /chunk <id>                    switch the visible chunk
//!   /highlight <start> <end> <text...>  start a chunk conversation
//!   /main                          talk to the main conversation again
//!   /quit                          exit

use std::error::Error;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use margin::api::ApiClient;
use margin::auth::{AuthClient, CredentialVault};
use margin::channel::{ConversationChannel, DocumentChannel};
use margin::config::ClientConfig;
use margin::session::{DocumentSession, SessionPolicy};
use margin_protocol::HighlightRange;
use margin_store::{ChunkId, ConversationStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        tracing::error!(%error, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let config = ClientConfig::load();

    match command.as_str() {
        "upload" => {
            let path = args.next().ok_or("usage: margin upload <file>")?;
            let upload = ApiClient::new(&config)
                .upload_document(path.as_ref())
                .await?;
            println!("{}", upload.document_id);
            Ok(())
        }
        "chat" => {
            let document_id = args.next().ok_or("usage: margin chat <document-id>")?;
            chat(&config, &document_id).await
        }
        _ => Err("usage: margin <upload|chat> ...".into()),
    }
}

async fn chat(config: &ClientConfig, document_id: &str) -> Result<(), Box<dyn Error>> {
    let auth = AuthClient::new(config, CredentialVault::new(CredentialVault::default_path()));
    match auth.restore() {
        Some(credentials) => tracing::info!(user = %credentials.user.email, "restored session"),
        None => tracing::info!("no persisted session; continuing anonymously"),
    }

    let metadata_channel = DocumentChannel::open(config, document_id)?;
    metadata_channel.on_metadata(|payload| {
        tracing::info!(metadata = %payload, "document metadata");
    });

    let conversations = ConversationChannel::open(config, document_id);
    let store = Arc::new(ConversationStore::new());
    let session = DocumentSession::new(
        store.clone(),
        conversations,
        SessionPolicy::from_config(config),
    );

    println!("initializing conversation...");
    session.initialize(ChunkId::new("0")).await?;
    let main_id = session
        .main_conversation_id()
        .await
        .ok_or("no main conversation after initialization")?;
    println!("ready. conversation {main_id}");

    let mut active = main_id.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("/chunk ") {
            let chunk = ChunkId::new(rest.trim());
            session.set_visible_chunk(chunk.clone()).await?;
            let loaded = store.conversations_for_chunk(&chunk);
            println!("chunk {chunk}: {} conversation(s)", loaded.len());
            continue;
        }

        if let Some(rest) = line.strip_prefix("/highlight ") {
            let mut parts = rest.splitn(3, ' ');
            let (start, end, text) = match (parts.next(), parts.next(), parts.next()) {
                (Some(start), Some(end), Some(text)) => (start, end, text),
                _ => {
                    println!("usage: /highlight <start> <end> <text>");
                    continue;
                }
            };
            let range = HighlightRange {
                start: start.parse()?,
                end: end.parse()?,
            };
            let chunk = session
                .active_chunk()
                .await
                .unwrap_or_else(|| ChunkId::new("0"));
            match session
                .create_chunk_conversation(text, chunk, Some(range))
                .await
            {
                Ok(conversation_id) => {
                    println!("highlight conversation {conversation_id}");
                    active = conversation_id;
                }
                Err(error) => println!("error: {error}"),
            }
            continue;
        }

        match line.as_str() {
            "/main" => {
                active = main_id.clone();
                println!("talking to main conversation");
            }
            "/quit" => break,
            _ => match session.send_message(&active, &line).await {
                Ok(reply) => println!("assistant: {}", reply.content),
                Err(error) => println!("error: {error}"),
            },
        }
    }

    metadata_channel.close();
    Ok(())
}
