use std::time::Duration;

use serde_json::Value;

/// Connect-attempt ceiling before an attempt counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// First reconnect delay; doubles on every failed attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Reconnects stop once this many attempts have failed in a row.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// A frame sent automatically after every successful open, at most once per
/// open. The metadata channel uses this for its initial `document.metadata`
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAnnouncement {
    pub event: String,
    pub payload: Value,
}

impl OpenAnnouncement {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Per-channel connection behavior.
///
/// Channel flavors are configuration, not subtypes: the metadata channel is
/// a `ChannelConfig` with an open announcement, the conversation channel is
/// one with error-frame redirection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Scheme and authority plus any path prefix, e.g. `ws://host:8000/api`.
    pub base_url: String,
    /// Channel path joined with the document id, e.g. `/conversations/stream`.
    pub endpoint_path: String,
    pub open_announcement: Option<OpenAnnouncement>,
    /// When set, inbound `{type, error}` envelopes dispatch their error
    /// object to `"<type>.error"` handlers instead of `type`.
    pub redirect_error_frames: bool,
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ChannelConfig {
    pub fn new(base_url: impl Into<String>, endpoint_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint_path: endpoint_path.into(),
            open_announcement: None,
            redirect_error_frames: false,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }

    pub fn with_open_announcement(mut self, announcement: OpenAnnouncement) -> Self {
        self.open_announcement = Some(announcement);
        self
    }

    pub fn with_redirect_error_frames(mut self) -> Self {
        self.redirect_error_frames = true;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}
