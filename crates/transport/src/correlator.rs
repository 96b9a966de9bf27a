use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use margin_protocol::ErrorData;

use super::connection::{Connection, HandlerId};
use super::error::{ExchangeAbandonedSnafu, ServerSnafu, TransportError, TransportResult};

const DEFAULT_SERVER_ERROR: &str = "request failed";

type Settlement = TransportResult<Value>;

struct PendingKind {
    // Kept only so the table can describe itself; the dispatchers stay
    // registered for the connection's lifetime once a kind is first used.
    completed_event: String,
    entries: VecDeque<(u64, oneshot::Sender<Settlement>)>,
}

#[derive(Default)]
struct CorrelationTable {
    next_entry_id: u64,
    // Keyed by completed-event name; one dispatcher pair per kind.
    pending: HashMap<String, PendingKind>,
}

/// Turns the connection's fire-and-forget frames into awaitable exchanges.
///
/// Every in-flight request is an entry in the correlation table, keyed by
/// its completed/error event-name pair. The first terminal frame for a kind
/// settles the oldest entry and removes it; an entry whose future is
/// dropped (caller timeout, cancellation) removes itself, so a late frame
/// finds nothing to settle and is ignored like any other unclaimed event.
#[derive(Clone)]
pub struct Correlator {
    connection: Connection,
    table: Arc<Mutex<CorrelationTable>>,
}

impl Correlator {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            table: Arc::new(Mutex::new(CorrelationTable::default())),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Sends `send_event` and resolves with the first `completed_event`
    /// frame, or fails with the server message carried by the first
    /// `error_event` frame. No timeout is imposed here; timeout policy
    /// belongs to the caller.
    pub async fn request(
        &self,
        send_event: &str,
        payload: Value,
        completed_event: &str,
        error_event: &str,
    ) -> TransportResult<Value> {
        let (receiver, _ticket) = self.enlist(completed_event, error_event);
        self.connection.send(send_event, payload)?;

        match receiver.await {
            Ok(settlement) => settlement,
            Err(_closed) => ExchangeAbandonedSnafu {
                stage: "request",
                event: send_event.to_string(),
            }
            .fail(),
        }
    }

    /// Starts a streaming exchange: zero or more `token_event` frames, then
    /// exactly one terminal (`completed_event` or `error_event`).
    ///
    /// Tokens are observed through the returned exchange as they arrive;
    /// the exchange yields exactly one terminal event. Dropping it
    /// deregisters all three handlers.
    pub fn send_streaming(
        &self,
        send_event: &str,
        payload: Value,
        token_event: &str,
        completed_event: &str,
        error_event: &str,
    ) -> TransportResult<StreamingExchange> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let settled = Arc::new(AtomicBool::new(false));
        let mut guard = StreamGuard {
            connection: self.connection.clone(),
            handlers: Vec::with_capacity(3),
        };

        let token_id = self.connection.on_message(token_event, {
            let event_tx = event_tx.clone();
            let settled = settled.clone();
            move |payload: &Value| {
                if !settled.load(Ordering::SeqCst) {
                    let _ = event_tx.send(StreamEvent::Token(payload.clone()));
                }
            }
        });
        guard.handlers.push((token_event.to_string(), token_id));

        let completed_id = self.connection.on_message(completed_event, {
            let event_tx = event_tx.clone();
            let settled = settled.clone();
            move |payload: &Value| {
                if !settled.swap(true, Ordering::SeqCst) {
                    let _ = event_tx.send(StreamEvent::Completed(payload.clone()));
                }
            }
        });
        guard
            .handlers
            .push((completed_event.to_string(), completed_id));

        let error_id = self.connection.on_message(error_event, {
            let settled = settled.clone();
            move |payload: &Value| {
                if !settled.swap(true, Ordering::SeqCst) {
                    let _ = event_tx.send(StreamEvent::Failed(server_error(payload, "streaming")));
                }
            }
        });
        guard.handlers.push((error_event.to_string(), error_id));

        self.connection.send(send_event, payload)?;

        Ok(StreamingExchange {
            events,
            _guard: guard,
        })
    }

    fn enlist(
        &self,
        completed_event: &str,
        error_event: &str,
    ) -> (oneshot::Receiver<Settlement>, CorrelationTicket) {
        let mut table = lock_table(&self.table);

        if !table.pending.contains_key(completed_event) {
            let key = completed_event.to_string();

            self.connection.on_message(completed_event, {
                let table = self.table.clone();
                let key = key.clone();
                move |payload: &Value| settle(&table, &key, Ok(payload.clone()))
            });
            self.connection.on_message(error_event, {
                let table = self.table.clone();
                let key = key.clone();
                move |payload: &Value| settle(&table, &key, Err(server_error(payload, "request")))
            });

            table.pending.insert(
                key.clone(),
                PendingKind {
                    completed_event: key,
                    entries: VecDeque::new(),
                },
            );
        }

        let entry_id = table.next_entry_id;
        table.next_entry_id += 1;

        let (sender, receiver) = oneshot::channel();
        if let Some(kind) = table.pending.get_mut(completed_event) {
            kind.entries.push_back((entry_id, sender));
        }

        let ticket = CorrelationTicket {
            table: self.table.clone(),
            key: completed_event.to_string(),
            entry_id,
        };
        (receiver, ticket)
    }
}

/// Settles the oldest pending entry for `key` exactly once.
fn settle(table: &Arc<Mutex<CorrelationTable>>, key: &str, settlement: Settlement) {
    let mut table = lock_table(table);
    let Some(kind) = table.pending.get_mut(key) else {
        return;
    };
    let Some((_, sender)) = kind.entries.pop_front() else {
        tracing::debug!(event = %kind.completed_event, "terminal frame with no pending request");
        return;
    };
    // The receiver may already be gone (caller timed out); that is fine.
    let _ = sender.send(settlement);
}

fn server_error(payload: &Value, stage: &'static str) -> TransportError {
    let message = match payload {
        Value::String(text) if !text.trim().is_empty() => text.clone(),
        other => serde_json::from_value::<ErrorData>(other.clone())
            .unwrap_or_default()
            .message_or(DEFAULT_SERVER_ERROR),
    };
    ServerSnafu { stage, message }.build()
}

/// Removes its table entry when dropped, whether the request settled or the
/// caller gave up. Settled entries are already gone, so the drop is a no-op.
struct CorrelationTicket {
    table: Arc<Mutex<CorrelationTable>>,
    key: String,
    entry_id: u64,
}

impl Drop for CorrelationTicket {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        if let Some(kind) = table.pending.get_mut(&self.key) {
            kind.entries.retain(|(id, _)| *id != self.entry_id);
        }
    }
}

/// One streamed exchange in flight.
#[derive(Debug)]
pub enum StreamEvent {
    /// Intermediate token payload; zero or more per exchange.
    Token(Value),
    /// Terminal success payload; exactly one terminal event per exchange.
    Completed(Value),
    Failed(TransportError),
}

pub struct StreamingExchange {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    _guard: StreamGuard,
}

impl StreamingExchange {
    /// Next stream event; `None` only if the connection died before a
    /// terminal frame arrived.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

struct StreamGuard {
    connection: Connection,
    handlers: Vec<(String, HandlerId)>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        for (event, id) in self.handlers.drain(..) {
            self.connection.off(&event, id);
        }
    }
}

fn lock_table(table: &Arc<Mutex<CorrelationTable>>) -> std::sync::MutexGuard<'_, CorrelationTable> {
    table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
