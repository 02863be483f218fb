use kafka_protocol::error::ResponseError;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Boxed error type used at filter boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can terminate a proxied connection.
///
/// No variant is recoverable: the engine closes the connection on any of
/// these. The distinction matters for what the client observes (a
/// Kafka-shaped error response vs. a bare TCP close) and for logging.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A message arrived that is not admissible in the current session state,
    /// e.g. a second PROXY preamble or a repeated `initiate_connect`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The codec hit a frame larger than the configured maximum.
    #[error("frame of {received} bytes exceeds maximum {max}")]
    OversizedFrame { received: usize, max: usize },

    /// The pre-forwarding buffer outgrew its configured bound.
    #[error("buffered {buffered} bytes before forwarding, limit is {limit}")]
    BufferOverflow { buffered: usize, limit: usize },

    /// Any other failure on the client side of the connection.
    #[error("client channel error: {0}")]
    Client(#[source] BoxError),

    /// Any failure on the broker side of the connection.
    #[error("server channel error: {0}")]
    Server(#[source] BoxError),

    /// The broker returned a correlation id with no in-flight entry.
    #[error("response with unknown correlation id {0}")]
    UnknownCorrelation(i32),

    /// A filter's apply hook failed.
    #[error("filter {name} failed: {source}")]
    Filter {
        name: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("frame codec error: {0}")]
    Codec(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The Kafka error code a client should see for this failure, if the
    /// protocol permits sending one at all. Errors before `Forwarding` is
    /// reached never produce a response; that gating happens in the
    /// downstream handler, not here.
    pub fn kafka_error(&self) -> Option<ResponseError> {
        match self {
            ProxyError::ProtocolViolation(_) => None,
            ProxyError::OversizedFrame { .. } | ProxyError::BufferOverflow { .. } => {
                Some(ResponseError::InvalidRequest)
            }
            ProxyError::Client(_) | ProxyError::Codec(_) | ProxyError::Io(_) => {
                Some(ResponseError::UnknownServerError)
            }
            ProxyError::Server(_) | ProxyError::UnknownCorrelation(_) => {
                Some(ResponseError::UnknownServerError)
            }
            ProxyError::Filter { .. } => Some(ResponseError::UnknownServerError),
        }
    }

}
