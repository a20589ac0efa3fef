pub mod error;

pub use error::{
    BoxError, ConfigError, ConversionError, Error, ErrorKind, IntegrationError, LedgerError,
    QueueError, Result, StageError, StorageError,
};
