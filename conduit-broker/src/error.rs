//! Error types for broker operations.

/// Boxed cause carried by [`Error::Broker`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for broker operations.
///
/// Callers see failures of consumers and producers as [`Error::Broker`]; the
/// message always names the topic and the cause chain carries the backend
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation on a topic failed.
    #[error("{message}")]
    Broker {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A registered consumer, producer, broker or topic could not be found.
    #[error("{0} is not registered")]
    NotFound(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An event could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A backend client reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Kafka client error.
    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Pulsar client error.
    #[cfg(feature = "pulsar")]
    #[error("pulsar error: {0}")]
    Pulsar(#[from] pulsar::Error),
}

impl Error {
    /// Wrap a cause with a topic-identifying message.
    pub fn broker(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Broker {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// A broker error without an underlying cause.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<apache_avro::Error> for Error {
    fn from(e: apache_avro::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Describe the innermost cause of an error.
pub fn root_cause_description(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;
