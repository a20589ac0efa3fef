//! Durable record of which (original image, request) pairs a stage has already handled.

pub mod entity;
pub mod sea;

pub use sea::SeaOrmLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::model::FilterType;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub original: String,
    pub request: String,
    pub stage: FilterType,
}

impl LedgerKey {
    pub fn new(original: impl Into<String>, request: impl Into<String>, stage: FilterType) -> Self {
        Self {
            original: original.into(),
            request: request.into(),
            stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub key: LedgerKey,
    pub modified: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn new(key: LedgerKey, modified: Option<String>) -> Self {
        Self {
            key,
            modified,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn find(&self, key: &LedgerKey) -> Result<Option<ProcessedRecord>>;

    async fn exists(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.find(key).await?.is_some())
    }

    /// Opens a write transaction. Nothing inserted through it is visible until `commit`.
    async fn begin(&self) -> Result<Box<dyn LedgerTxn>>;
}

#[async_trait]
pub trait LedgerTxn: Send {
    /// Fails with `LedgerError::AlreadyExists` when the key is already recorded.
    async fn insert(&mut self, record: &ProcessedRecord) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
