use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use margin_protocol::Envelope;

use super::config::ChannelConfig;
use super::error::{
    ConnectionClosedSnafu, RetriesExhaustedSnafu, SerializeFrameSnafu, SocketWriteSnafu,
    TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by `on_message`, needed to deregister that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner called `close()`; the connection is never reused.
    Explicit,
    /// The reconnect attempt cap was reached.
    RetriesExhausted { attempts: u32 },
}

/// Published connection state. `terminal` is set exactly once, when the
/// connection will never open again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub terminal: Option<CloseReason>,
}

impl LinkStatus {
    fn idle() -> Self {
        Self {
            state: LinkState::Idle,
            terminal: None,
        }
    }
}

enum Command {
    Send { event: String, payload: Value },
    Close,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
}

impl Registry {
    fn register(&mut self, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn deregister(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(entries) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    /// Registration-order snapshot, so dispatch never holds the lock while
    /// running handlers (which may register or deregister).
    fn snapshot(&self, event: &str) -> Vec<Handler> {
        self.handlers
            .get(event)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.handlers.clear();
    }
}

/// One reconnecting WebSocket link for one (document, channel) pair.
///
/// The handle is cheap to clone; all clones drive the same underlying
/// socket. Sends issued before the link opens are queued and flushed FIFO
/// the instant it does. Unexpected closes trigger exponential-backoff
/// reconnects up to the configured attempt cap; `close()` is final.
///
/// Must be opened from within a tokio runtime.
#[derive(Clone)]
pub struct Connection {
    command_tx: mpsc::UnboundedSender<Command>,
    registry: Arc<Mutex<Registry>>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl Connection {
    pub fn open(document_id: impl Into<String>, config: ChannelConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::idle());
        let registry = Arc::new(Mutex::new(Registry::default()));

        let driver = Driver {
            document_id: document_id.into(),
            config,
            command_rx,
            status_tx,
            registry: registry.clone(),
            queue: VecDeque::new(),
        };
        tokio::spawn(driver.run());

        Self {
            command_tx,
            registry,
            status_rx,
        }
    }

    /// Queues or transmits one `{type, data}` frame. Callers may send before
    /// the link is open; delivery order always matches call order.
    pub fn send(&self, event: &str, payload: Value) -> TransportResult<()> {
        self.command_tx
            .send(Command::Send {
                event: event.to_string(),
                payload,
            })
            .ok()
            .context(ConnectionClosedSnafu { stage: "send" })
    }

    pub fn on_message(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> HandlerId {
        lock_registry(&self.registry).register(event, Arc::new(handler))
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        lock_registry(&self.registry).deregister(event, id)
    }

    pub fn state(&self) -> LinkState {
        self.status_rx.borrow().state
    }

    /// Resolves once the link is open; fails once it is permanently closed.
    pub async fn wait_for_connection(&self) -> TransportResult<()> {
        let mut status_rx = self.status_rx.clone();
        loop {
            let status = *status_rx.borrow();
            match status.terminal {
                Some(CloseReason::Explicit) => {
                    return ConnectionClosedSnafu {
                        stage: "wait-for-connection",
                    }
                    .fail();
                }
                Some(CloseReason::RetriesExhausted { attempts }) => {
                    return RetriesExhaustedSnafu {
                        stage: "wait-for-connection",
                        attempts,
                    }
                    .fail();
                }
                None => {}
            }
            if status.state == LinkState::Open {
                return Ok(());
            }
            if status_rx.changed().await.is_err() {
                return ConnectionClosedSnafu {
                    stage: "wait-for-connection",
                }
                .fail();
            }
        }
    }

    /// Final: suppresses reconnection, closes the socket, clears all
    /// handlers and any queued frames. A closed connection is not reused.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
        lock_registry(&self.registry).clear();
    }
}

struct Driver {
    document_id: String,
    config: ChannelConfig,
    command_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<LinkStatus>,
    registry: Arc<Mutex<Registry>>,
    queue: VecDeque<(String, Value)>,
}

enum PumpOutcome {
    /// Socket dropped out from under us; reconnect.
    LinkLost,
    /// The owner closed the connection; shut down for good.
    Closed,
}

impl Driver {
    async fn run(mut self) {
        let url = format!(
            "{}{}/{}",
            self.config.base_url, self.config.endpoint_path, self.document_id
        );
        let mut attempt: u32 = 0;

        loop {
            self.publish(LinkState::Connecting, None);
            tracing::debug!(url = %url, attempt, "connecting websocket");

            let connected =
                tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                    .await;
            let mut socket = match connected {
                Ok(Ok((socket, _response))) => socket,
                Ok(Err(error)) => {
                    tracing::warn!(url = %url, %error, "websocket connect failed");
                    self.publish(LinkState::Closed, None);
                    if !self.backoff(&mut attempt).await {
                        return;
                    }
                    continue;
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        url = %url,
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "websocket connect timed out"
                    );
                    self.publish(LinkState::Closed, None);
                    if !self.backoff(&mut attempt).await {
                        return;
                    }
                    continue;
                }
            };

            attempt = 0;
            self.publish(LinkState::Open, None);
            tracing::info!(url = %url, "websocket connected");

            // Sends issued while the connect attempt was in flight sit in the
            // command channel; fold them behind the queued ones so the flush
            // preserves global call order.
            loop {
                match self.command_rx.try_recv() {
                    Ok(Command::Send { event, payload }) => {
                        self.queue.push_back((event, payload));
                    }
                    Ok(Command::Close) => {
                        let _ = socket.close(None).await;
                        self.shutdown(CloseReason::Explicit);
                        return;
                    }
                    Err(_) => break,
                }
            }

            let mut link_lost = false;
            while let Some((event, payload)) = self.queue.pop_front() {
                if let Err(error) = send_frame(&mut socket, &event, &payload).await {
                    tracing::warn!(%event, %error, "flush failed; frame requeued");
                    self.queue.push_front((event, payload));
                    link_lost = true;
                    break;
                }
            }

            // Announcement goes out after the queue drains, once per open.
            if !link_lost && let Some(announcement) = self.config.open_announcement.clone() {
                if let Err(error) =
                    send_frame(&mut socket, &announcement.event, &announcement.payload).await
                {
                    tracing::warn!(event = %announcement.event, %error, "open announcement failed");
                    link_lost = true;
                }
            }

            if !link_lost {
                match self.pump(&mut socket).await {
                    PumpOutcome::Closed => {
                        self.shutdown(CloseReason::Explicit);
                        return;
                    }
                    PumpOutcome::LinkLost => {}
                }
            }

            self.publish(LinkState::Closed, None);
            tracing::info!(url = %url, "websocket link lost");
            if !self.backoff(&mut attempt).await {
                return;
            }
        }
    }

    async fn pump(&mut self, socket: &mut WsStream) -> PumpOutcome {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Send { event, payload }) => {
                        if let Err(error) = send_frame(socket, &event, &payload).await {
                            tracing::warn!(%event, %error, "send failed; frame requeued");
                            self.queue.push_back((event, payload));
                            return PumpOutcome::LinkLost;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = socket.close(None).await;
                        return PumpOutcome::Closed;
                    }
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("server sent close frame");
                        return PumpOutcome::LinkLost;
                    }
                    // Pings are answered by the protocol layer; binary frames
                    // are not part of this protocol.
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%error, "websocket read error");
                        return PumpOutcome::LinkLost;
                    }
                    None => {
                        tracing::info!("websocket stream ended");
                        return PumpOutcome::LinkLost;
                    }
                },
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Malformed frames never take the connection down.
                tracing::warn!(%error, "dropping unparseable frame");
                return;
            }
        };

        let Envelope { event, data, error } = envelope;
        let (event, payload) = match error {
            Some(error_payload) if self.config.redirect_error_frames => {
                (format!("{event}.error"), error_payload)
            }
            _ => (event, data.unwrap_or(Value::Null)),
        };

        let handlers = lock_registry(&self.registry).snapshot(&event);
        if handlers.is_empty() {
            tracing::debug!(%event, "no handlers registered for frame");
            return;
        }
        for handler in handlers {
            handler(&payload);
        }
    }

    /// Sleeps out the backoff window for the current attempt, still
    /// accepting queued sends. Returns false when the connection is done
    /// for good (cap reached or owner closed it mid-wait).
    async fn backoff(&mut self, attempt: &mut u32) -> bool {
        if *attempt >= self.config.max_reconnect_attempts {
            tracing::error!(attempts = *attempt, "max reconnection attempts reached");
            self.shutdown(CloseReason::RetriesExhausted { attempts: *attempt });
            return false;
        }

        let delay = reconnect_delay(self.config.reconnect_base_delay, *attempt);
        tracing::info!(
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        *attempt += 1;

        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.command_rx.recv() => match command {
                    Some(Command::Send { event, payload }) => {
                        self.queue.push_back((event, payload));
                    }
                    Some(Command::Close) | None => {
                        self.shutdown(CloseReason::Explicit);
                        return false;
                    }
                },
            }
        }
    }

    fn shutdown(&mut self, reason: CloseReason) {
        self.queue.clear();
        lock_registry(&self.registry).clear();
        self.command_rx.close();
        self.publish(LinkState::Closed, Some(reason));
    }

    fn publish(&self, state: LinkState, terminal: Option<CloseReason>) {
        let _ = self.status_tx.send(LinkStatus { state, terminal });
    }
}

/// Delay before reconnect attempt `attempt` (0-indexed): `base * 2^attempt`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

async fn send_frame(socket: &mut WsStream, event: &str, payload: &Value) -> TransportResult<()> {
    let frame = Envelope::outbound(event, payload.clone())
        .to_json()
        .context(SerializeFrameSnafu {
            stage: "send-frame",
            event: event.to_string(),
        })?;
    tracing::debug!(%event, "sending frame");
    socket
        .send(Message::text(frame))
        .await
        .context(SocketWriteSnafu { stage: "send-frame" })
}

fn lock_registry(registry: &Arc<Mutex<Registry>>) -> std::sync::MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
