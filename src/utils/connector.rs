use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::errors::{LedgerError, Result};

/// Opens the ledger database. In-memory SQLite is pinned to a single connection
/// so every query sees the same database.
pub async fn db_connection(url: &str, pool_size: Option<u32>) -> Result<DatabaseConnection> {
    let in_memory = url.starts_with("sqlite") && url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { pool_size.unwrap_or(10) };

    let mut db_options = ConnectOptions::new(url.to_string());
    db_options
        .max_connections(max_connections)
        .min_connections(if in_memory { 1 } else { 0 })
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Trace);

    Database::connect(db_options).await.map_err(|e| {
        log::error!("Failed to connect to database: {}", e);
        LedgerError::ConnectionError(e.into()).into()
    })
}
