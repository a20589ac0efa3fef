use async_trait::async_trait;
use log::info;
use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, Schema,
};
use std::sync::Arc;

use super::entity::{self, Column, Entity};
use super::{Ledger, LedgerKey, LedgerTxn, ProcessedRecord};
use crate::errors::{LedgerError, Result};
use crate::utils::txn::begin_write;

const UNIQUE_INDEX: &str = "ux_processed_original_request_stage";

pub struct SeaOrmLedger {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates the `processed` table and its unique key when missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let mut table = schema.create_table_from_entity(Entity);
        table.if_not_exists();
        self.db.execute(backend.build(&table)).await?;

        let index = Index::create()
            .name(UNIQUE_INDEX)
            .table(Entity)
            .col(Column::Original)
            .col(Column::Request)
            .col(Column::Stage)
            .unique()
            .if_not_exists()
            .to_owned();
        self.db.execute(backend.build(&index)).await?;

        info!("Ledger schema ready on {:?}", backend);
        Ok(())
    }
}

fn to_record(model: entity::Model) -> Result<ProcessedRecord> {
    Ok(ProcessedRecord {
        key: LedgerKey {
            original: model.original,
            request: model.request,
            stage: model.stage.parse()?,
        },
        modified: model.modified,
        created_at: model.created_at,
    })
}

#[async_trait]
impl Ledger for SeaOrmLedger {
    async fn find(&self, key: &LedgerKey) -> Result<Option<ProcessedRecord>> {
        let model = Entity::find()
            .filter(Column::Original.eq(key.original.as_str()))
            .filter(Column::Request.eq(key.request.as_str()))
            .filter(Column::Stage.eq(key.stage.slug()))
            .one(self.db.as_ref())
            .await?;
        model.map(to_record).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTxn>> {
        let txn = begin_write(&self.db).await?;
        Ok(Box::new(SeaOrmTxn { txn }))
    }
}

struct SeaOrmTxn {
    txn: DatabaseTransaction,
}

#[async_trait]
impl LedgerTxn for SeaOrmTxn {
    async fn insert(&mut self, record: &ProcessedRecord) -> Result<()> {
        let model = entity::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            original: Set(record.key.original.clone()),
            request: Set(record.key.request.clone()),
            stage: Set(record.key.stage.slug().to_string()),
            modified: Set(record.modified.clone()),
            created_at: Set(record.created_at),
        };
        Entity::insert(model)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn
            .commit()
            .await
            .map_err(|e| LedgerError::TransactionError(e.into()).into())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.txn
            .rollback()
            .await
            .map_err(|e| LedgerError::TransactionError(e.into()).into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::model::FilterType;
    use crate::utils::connector::db_connection;

    pub(crate) async fn memory_ledger() -> SeaOrmLedger {
        let db = db_connection("sqlite::memory:", None)
            .await
            .expect("sqlite connection");
        let ledger = SeaOrmLedger::new(Arc::new(db));
        ledger.ensure_schema().await.expect("schema");
        ledger
    }

    #[tokio::test]
    async fn test_insert_commit_find() {
        let ledger = memory_ledger().await;
        let key = LedgerKey::new("img-1", "req-1", FilterType::Gray);
        assert!(!ledger.exists(&key).await.unwrap());

        let mut txn = ledger.begin().await.unwrap();
        txn.insert(&ProcessedRecord::new(key.clone(), Some("img-2".into())))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let found = ledger.find(&key).await.unwrap().unwrap();
        assert_eq!(found.modified.as_deref(), Some("img-2"));
        assert_eq!(found.key, key);
    }

    #[tokio::test]
    async fn test_rollback_leaves_no_trace() {
        let ledger = memory_ledger().await;
        let key = LedgerKey::new("img-1", "req-1", FilterType::Gauss);

        let mut txn = ledger.begin().await.unwrap();
        txn.insert(&ProcessedRecord::new(key.clone(), None))
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        assert!(!ledger.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let ledger = memory_ledger().await;
        let key = LedgerKey::new("img-1", "req-1", FilterType::Threshold);

        let mut txn = ledger.begin().await.unwrap();
        txn.insert(&ProcessedRecord::new(key.clone(), None))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = ledger.begin().await.unwrap();
        let err = txn
            .insert(&ProcessedRecord::new(key.clone(), None))
            .await
            .unwrap_err();
        assert!(err.is_duplicate(), "unexpected error: {err}");
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_pair_at_other_stage_is_distinct() {
        let ledger = memory_ledger().await;
        for stage in [FilterType::Gray, FilterType::Gauss] {
            let mut txn = ledger.begin().await.unwrap();
            txn.insert(&ProcessedRecord::new(
                LedgerKey::new("img-1", "req-1", stage),
                None,
            ))
            .await
            .unwrap();
            txn.commit().await.unwrap();
        }
        assert!(
            ledger
                .exists(&LedgerKey::new("img-1", "req-1", FilterType::Gauss))
                .await
                .unwrap()
        );
    }
}
