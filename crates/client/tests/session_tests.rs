//! End-to-end session tests against a scripted conversation-channel server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use margin::config::ClientConfig;
use margin::channel::ConversationChannel;
use margin::session::{DocumentSession, SessionError, SessionPolicy};
use margin_store::{ChunkId, ConversationStore, Role};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts one conversation-channel client and answers each inbound frame
/// with whatever the scenario closure returns.
async fn spawn_server<F>(mut respond: F) -> SocketAddr
where
    F: FnMut(&Value) -> Vec<Value> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                for response in respond(&frame) {
                    socket
                        .send(Message::text(response.to_string()))
                        .await
                        .unwrap();
                }
            }
        }
    });

    addr
}

fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        ws_base_url: format!("ws://{addr}"),
        connect_timeout_ms: 2_000,
        reconnect_base_delay_ms: 20,
        max_reconnect_attempts: 2,
        create_conversation_timeout_ms: 300,
        ..ClientConfig::default()
    }
}

fn new_session(config: &ClientConfig, document_id: &str) -> (Arc<ConversationStore>, DocumentSession) {
    let store = Arc::new(ConversationStore::new());
    let session = DocumentSession::new(
        store.clone(),
        ConversationChannel::open(config, document_id),
        SessionPolicy::from_config(config),
    );
    (store, session)
}

fn completed(event: &str, data: Value) -> Value {
    json!({ "type": format!("{event}.completed"), "data": data })
}

fn empty_chunk_list(frame: &Value) -> Option<Vec<Value>> {
    (frame["type"] == "conversation.chunk.list")
        .then(|| vec![completed("conversation.chunk.list", json!({ "conversations": {} }))])
}

#[tokio::test]
async fn discovery_creates_main_when_none_listed() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let server_list_calls = list_calls.clone();

    let addr = spawn_server(move |frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => {
                server_list_calls.fetch_add(1, Ordering::SeqCst);
                vec![completed("conversation.list", json!({ "conversations": {} }))]
            }
            "conversation.main.create" => vec![completed(
                "conversation.main.create",
                json!({ "conversation_id": "main-1" }),
            )],
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        session.main_conversation_id().await.unwrap().as_str(),
        "main-1"
    );
    assert!(store.main_conversation().is_some());

    // Guarded exactly-once: a second call never re-runs discovery.
    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn discovery_adopts_first_listed_conversation_and_replays_history() {
    let addr = spawn_server(|frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => vec![completed(
                "conversation.list",
                json!({ "conversations": { "main-9": {} } }),
            )],
            "conversation.messages.get" => vec![completed(
                "conversation.messages.get",
                json!({
                    "conversation_id": "main-9",
                    "messages": [
                        { "id": "m1", "role": "user", "content": "hello", "created_at": 1700000000 },
                        { "id": "m2", "role": "assistant", "content": "hi there", "created_at": 1700000005 }
                    ]
                }),
            )],
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();

    let main_id = session.main_conversation_id().await.unwrap();
    assert_eq!(main_id.as_str(), "main-9");

    let history = store.get_messages(&main_id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn chunk_load_skips_empty_highlight_conversations() {
    let addr = spawn_server(|frame| match frame["type"].as_str().unwrap() {
        "conversation.list" => vec![completed(
            "conversation.list",
            json!({ "conversations": { "main-1": {} } }),
        )],
        "conversation.chunk.list" => {
            assert_eq!(frame["data"]["chunk_id"], "3");
            vec![completed(
                "conversation.chunk.list",
                json!({
                    "conversations": {
                        "c-empty": { "chunk_id": "3", "highlight_text": "" },
                        "c-hello": {
                            "chunk_id": "3",
                            "highlight_text": "hello",
                            "highlight_range": { "start": 5, "end": 10 }
                        }
                    }
                }),
            )]
        }
        "conversation.messages.get" => {
            let conversation_id = frame["data"]["conversation_id"].clone();
            vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": conversation_id, "messages": [] }),
            )]
        }
        other => panic!("unexpected frame: {other}"),
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("3")))
        .await
        .unwrap()
        .unwrap();

    let chunk = ChunkId::new("3");
    let surfaced = store.conversations_for_chunk(&chunk);
    assert_eq!(surfaced.len(), 1);
    assert_eq!(surfaced[0].id.as_str(), "c-hello");

    let highlights = store.get_highlights_for_chunk(&chunk);
    assert_eq!(highlights.len(), 1);
    assert_eq!(highlights[0].start_offset, 5);
    assert_eq!(highlights[0].end_offset, 10);
    assert_eq!(highlights[0].text, "hello");
}

#[tokio::test]
async fn switching_chunks_cleans_up_previous_highlights() {
    let addr = spawn_server(|frame| match frame["type"].as_str().unwrap() {
        "conversation.list" => vec![completed(
            "conversation.list",
            json!({ "conversations": { "main-1": {} } }),
        )],
        "conversation.chunk.list" => {
            let chunk_id = frame["data"]["chunk_id"].as_str().unwrap();
            let conversation_id = format!("conv-{chunk_id}");
            vec![completed(
                "conversation.chunk.list",
                json!({
                    "conversations": {
                        conversation_id: {
                            "chunk_id": chunk_id,
                            "highlight_text": format!("text in {chunk_id}"),
                            "highlight_range": { "start": 0, "end": 4 }
                        }
                    }
                }),
            )]
        }
        "conversation.messages.get" => {
            let conversation_id = frame["data"]["conversation_id"].clone();
            vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": conversation_id, "messages": [] }),
            )]
        }
        other => panic!("unexpected frame: {other}"),
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("a")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.get_highlights_for_chunk(&ChunkId::new("a")).len(), 1);

    tokio::time::timeout(TIMEOUT, session.set_visible_chunk(ChunkId::new("b")))
        .await
        .unwrap()
        .unwrap();

    assert!(store.get_highlights_for_chunk(&ChunkId::new("a")).is_empty());
    let b_highlights = store.get_highlights_for_chunk(&ChunkId::new("b"));
    assert_eq!(b_highlights.len(), 1);
    assert_eq!(b_highlights[0].text, "text in b");

    let b_conversations = store.conversations_for_chunk(&ChunkId::new("b"));
    assert_eq!(b_conversations.len(), 1);
    assert_eq!(b_conversations[0].id.as_str(), "conv-b");
}

#[tokio::test]
async fn streaming_send_commits_exactly_one_assistant_message() {
    let addr = spawn_server(|frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => vec![completed(
                "conversation.list",
                json!({ "conversations": { "main-1": {} } }),
            )],
            "conversation.messages.get" => vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": "main-1", "messages": [] }),
            )],
            "conversation.message.send" => vec![
                json!({ "type": "conversation.message.send.token", "data": { "token": "Hel" } }),
                json!({ "type": "conversation.message.send.token", "data": { "token": "lo" } }),
                completed(
                    "conversation.message.send",
                    json!({ "user_message_id": "m-7", "message": "Hello" }),
                ),
            ],
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();
    let main_id = session.main_conversation_id().await.unwrap();

    let reply = tokio::time::timeout(TIMEOUT, session.send_message(&main_id, "hi"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.content, "Hello");
    assert_eq!(reply.id.as_str(), "m-7");

    let messages = store.get_messages(&main_id);
    assert_eq!(messages.len(), 2, "one user + one assistant message");
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello");

    let snapshot = store.streaming_state(&main_id);
    assert!(!snapshot.is_streaming);
    assert!(snapshot.content.is_empty());
}

#[tokio::test]
async fn failed_stream_clears_state_and_keeps_no_partial_content() {
    let addr = spawn_server(|frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => vec![completed(
                "conversation.list",
                json!({ "conversations": { "main-1": {} } }),
            )],
            "conversation.messages.get" => vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": "main-1", "messages": [] }),
            )],
            "conversation.message.send" => vec![
                json!({ "type": "conversation.message.send.token", "data": { "token": "Boo" } }),
                json!({
                    "type": "conversation.message.send.error",
                    "data": { "message": "model exploded" }
                }),
            ],
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();
    let main_id = session.main_conversation_id().await.unwrap();

    let error = tokio::time::timeout(TIMEOUT, session.send_message(&main_id, "hi"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(error.to_string().contains("model exploded"), "got: {error}");

    let messages = store.get_messages(&main_id);
    assert_eq!(messages.len(), 1, "only the user message remains");
    assert_eq!(messages[0].role, Role::User);

    let snapshot = store.streaming_state(&main_id);
    assert!(!snapshot.is_streaming);
    assert!(snapshot.content.is_empty());
}

#[tokio::test]
async fn create_chunk_conversation_registers_store_records() {
    let addr = spawn_server(|frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => vec![completed(
                "conversation.list",
                json!({ "conversations": { "main-1": {} } }),
            )],
            "conversation.messages.get" => vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": "main-1", "messages": [] }),
            )],
            "conversation.chunk.create" => {
                assert_eq!(frame["data"]["highlight_text"], "picked text");
                assert_eq!(frame["data"]["highlight_range"]["start"], 12);
                vec![completed(
                    "conversation.chunk.create",
                    json!({ "conversation_id": "c-new" }),
                )]
            }
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("2")))
        .await
        .unwrap()
        .unwrap();

    let conversation_id = tokio::time::timeout(
        TIMEOUT,
        session.create_chunk_conversation(
            "picked text",
            ChunkId::new("2"),
            Some(margin_protocol::HighlightRange { start: 12, end: 23 }),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(conversation_id.as_str(), "c-new");
    assert!(store.get_conversation(&conversation_id).is_some());

    let highlights = store.get_highlights_for_chunk(&ChunkId::new("2"));
    assert_eq!(highlights.len(), 1);
    assert_eq!(highlights[0].conversation_id, conversation_id);
}

#[tokio::test]
async fn conversation_creation_times_out_as_a_distinct_error() {
    let addr = spawn_server(|frame| {
        if let Some(frames) = empty_chunk_list(frame) {
            return frames;
        }
        match frame["type"].as_str().unwrap() {
            "conversation.list" => vec![completed(
                "conversation.list",
                json!({ "conversations": { "main-1": {} } }),
            )],
            "conversation.messages.get" => vec![completed(
                "conversation.messages.get",
                json!({ "conversation_id": "main-1", "messages": [] }),
            )],
            // Never answer the creation request.
            "conversation.chunk.create" => Vec::new(),
            other => panic!("unexpected frame: {other}"),
        }
    })
    .await;

    let config = test_config(addr);
    let (_store, session) = new_session(&config, "doc-1");

    tokio::time::timeout(TIMEOUT, session.initialize(ChunkId::new("0")))
        .await
        .unwrap()
        .unwrap();

    let error = tokio::time::timeout(
        TIMEOUT,
        session.create_chunk_conversation("text", ChunkId::new("0"), None),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(
        matches!(
            error,
            SessionError::CreateConversationTimedOut { timeout_ms: 300, .. }
        ),
        "got: {error}"
    );
}

#[tokio::test]
async fn chunk_operations_require_an_initialized_session() {
    let addr = spawn_server(|_frame| Vec::new()).await;
    let config = test_config(addr);
    let (_store, session) = new_session(&config, "doc-1");

    let error = session
        .set_visible_chunk(ChunkId::new("1"))
        .await
        .unwrap_err();
    assert!(matches!(error, SessionError::NotReady { .. }), "got: {error}");
}
