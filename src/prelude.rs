// Message shapes and configuration
pub use crate::common::model::{ChainRequest, Config, DoneEvent, FilterType, ImageStatus};

// Errors
pub use crate::errors::{BoxError, Error, ErrorKind, Result};

// Stage building blocks
pub use crate::engine::{
    ChainRouter, ChainSubmitter, DoneTracker, Route, StageConsumer, StageOutcome, StageProcessor,
};
pub use crate::imaging::{ImageFilter, PixelPool, build_filter};
pub use crate::ledger::{Ledger, LedgerKey, ProcessedRecord, SeaOrmLedger};
pub use crate::queue::{KafkaQueue, MemoryQueue, Message, MqBackend, NackPolicy};
pub use crate::resilience::ResilienceEnvelope;
pub use crate::storage::{FileObjectStore, MemoryObjectStore, ObjectStore};
