use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Incomplete packet")]
    IncompletePacket,
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("Illegal remaining length: {0}")]
    IllegalLength(usize),
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("Unexpected packet type: {0:#04x}")]
    UnknownPacketType(u8),
    #[error("Unable to establish connection, statusCode is {status}: {reason}")]
    ConnectionRejected { status: u8, reason: String },
    #[error("Connection unavailable")]
    ConnectionUnavailable,
    #[error("Connection exception: {0}")]
    ConnectionException(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Acknowledgement has wrong packetId: expected {expected}, received {received}")]
    CorrelationMismatch { expected: u16, received: u16 },
    #[error("Subscription refused for packetId {packet_id}")]
    SubscriptionRefused { packet_id: u16 },
    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),
}

impl MqttError {
    /// Whether this error belongs to the protocol-violation family raised
    /// while decoding inbound bytes.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MqttError::Protocol(_)
                | MqttError::MalformedRemainingLength
                | MqttError::IllegalLength(_)
                | MqttError::InvalidEncoding(_)
                | MqttError::UnknownPacketType(_)
        )
    }
}
