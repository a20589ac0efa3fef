use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Boxed error used as the source of every wrapped failure.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Queue,
    Storage,
    Ledger,
    Conversion,
    Integration,
    Config,
    Codec,
    Stage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Ledger => write!(f, "ledger"),
            ErrorKind::Conversion => write!(f, "conversion"),
            ErrorKind::Integration => write!(f, "integration"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Codec => write!(f, "codec"),
            ErrorKind::Stage => write!(f, "stage"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: impl Into<String>, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message.into()),
            }),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.inner.message.as_deref()
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Storage)
    }

    pub fn is_ledger(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Ledger)
    }

    pub fn is_conversion(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Conversion)
    }

    pub fn is_integration(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Integration)
    }

    /// Borrow the typed source when it is of type `T`.
    pub fn downcast_source<T: StdError + 'static>(&self) -> Option<&T> {
        self.inner.source.as_ref().and_then(|s| s.downcast_ref::<T>())
    }

    /// Whether a failed external call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        self.downcast_source::<IntegrationError>()
            .is_some_and(IntegrationError::is_retryable)
    }

    /// A unique-key violation raised while recording into the ledger.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.downcast_source::<LedgerError>(),
            Some(LedgerError::AlreadyExists)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.downcast_source::<StorageError>(),
            Some(StorageError::NotFound(_))
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("pixelchain::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::Queue, Some(err))
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::new(ErrorKind::Storage, Some(err))
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        Error::new(ErrorKind::Ledger, Some(err))
    }
}

impl From<ConversionError> for Error {
    fn from(err: ConversionError) -> Self {
        Error::new(ErrorKind::Conversion, Some(err))
    }
}

impl From<IntegrationError> for Error {
    fn from(err: IntegrationError) -> Self {
        Error::new(ErrorKind::Integration, Some(err))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<StageError> for Error {
    fn from(err: StageError) -> Self {
        Error::new(ErrorKind::Stage, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("serialization failed: {0}")]
    SerializationFailed(#[source] BoxError),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(#[source] BoxError),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("push failed: {0}")]
    PushFailed(#[source] BoxError),
    #[error("{0}")]
    OperationFailed(#[source] BoxError),
    #[error("Failed to send request to Kafka after maximum attempts ({0})")]
    AttemptsExhausted(u32),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("{0}")]
    Io(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("connection error: {0}")]
    ConnectionError(#[source] BoxError),
    #[error("query execution error: {0}")]
    QueryExecutionError(#[source] BoxError),
    #[error("transaction error: {0}")]
    TransactionError(#[source] BoxError),
    #[error("record already exists")]
    AlreadyExists,
}

/// Every transform failure carries this type, whatever the underlying cause.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unable to apply {filter} filter: {reason}")]
    Failed { filter: String, reason: String },
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("decode failed: {0}")]
    Decode(#[source] BoxError),
    #[error("encode failed: {0}")]
    Encode(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Too many requests to target service per period")]
    TooManyRequests,
    #[error("circuit breaker '{0}' is open and does not permit further calls")]
    CallNotPermitted(String),
    #[error("target service responded {status}: {text}")]
    Status { status: u16, text: String },
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: BoxError,
        transient: bool,
    },
    #[error("unexpected response body: {0}")]
    Decode(#[source] BoxError),
}

impl IntegrationError {
    /// 5xx, 429 and transient transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            IntegrationError::Status { status, .. } => *status == 429 || *status >= 500,
            IntegrationError::Transport { transient, .. } => *transient,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] BoxError),
    #[error("failed to parse config: {0}")]
    Parse(#[source] BoxError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("filter chain is empty")]
    EmptyChain,
    #[error("unknown filter type: {0}")]
    UnknownFilter(String),
    #[error("stage is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn conversion_failed(filter: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::from(ConversionError::Failed {
            filter: filter.to_string(),
            reason: reason.into(),
        })
    }

    pub fn object_not_found(key: impl Into<String>) -> Self {
        Error::from(StorageError::NotFound(key.into()))
    }

    pub fn too_many_requests() -> Self {
        Error::from(IntegrationError::TooManyRequests)
    }

    pub fn queue_failed<E: Into<BoxError>>(source: E) -> Self {
        Error::from(QueueError::OperationFailed(source.into()))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from(StorageError::Io(err.into()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Codec, Some(err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::from(ConfigError::Parse(err.into()))
    }
}

impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        if let Some(sea_orm::SqlErr::UniqueConstraintViolation(_)) = err.sql_err() {
            return Error::from(LedgerError::AlreadyExists);
        }
        match err {
            sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_) => {
                Error::from(LedgerError::ConnectionError(err.into()))
            }
            _ => Error::from(LedgerError::QueryExecutionError(err.into())),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Error::from(IntegrationError::Decode(err.into()));
        }
        if let Some(status) = err.status() {
            return Error::from(IntegrationError::Status {
                status: status.as_u16(),
                text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        Error::from(IntegrationError::Transport {
            source: err.into(),
            transient,
        })
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(_) | image::ImageError::Parameter(_) => {
                Error::from(ConversionError::Encode(err.into()))
            }
            _ => Error::from(ConversionError::Decode(err.into())),
        }
    }
}
