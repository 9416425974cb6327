use lambda_runtime::Diagnostic;

// Every variant is Clone so a failed cold start can be replayed to each
// invocation that lands on the same execution environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("secret format error: {0}")]
    SecretFormat(String),
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),
    #[error("backing store error: {0}")]
    BackingStore(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("invalid invocation envelope: {0}")]
    Envelope(String),
}

impl Error {
    /// Stable name reported to the Lambda runtime as the error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::SecretFormat(_) => "SecretFormatError",
            Error::SecretUnavailable(_) => "SecretUnavailableError",
            Error::BackingStore(_) => "BackingStoreError",
            Error::Engine(_) => "EngineError",
            Error::Envelope(_) => "EnvelopeError",
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::BackingStore(err.to_string())
    }
}

impl From<Error> for Diagnostic {
    fn from(err: Error) -> Self {
        Diagnostic {
            error_type: err.kind().to_string(),
            error_message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
