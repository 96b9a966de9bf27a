pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;

pub use config::{
    ChannelConfig, OpenAnnouncement, CONNECT_TIMEOUT, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_BASE_DELAY,
};
pub use connection::{CloseReason, Connection, HandlerId, LinkState, LinkStatus};
pub use correlator::{Correlator, StreamEvent, StreamingExchange};
pub use error::{TransportError, TransportResult};
