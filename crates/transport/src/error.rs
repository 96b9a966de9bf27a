use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("connection is closed"))]
    ConnectionClosed { stage: &'static str },
    #[snafu(display("connection permanently closed after {attempts} reconnect attempts"))]
    RetriesExhausted { stage: &'static str, attempts: u32 },
    #[snafu(display("failed to serialize outbound frame '{event}'"))]
    SerializeFrame {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
    #[snafu(display("websocket write failed on `{stage}`"))]
    SocketWrite {
        stage: &'static str,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("server reported failure: {message}"))]
    Server {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("exchange '{event}' ended without a terminal frame"))]
    ExchangeAbandoned {
        stage: &'static str,
        event: String,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
