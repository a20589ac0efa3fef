pub mod connector;
pub mod logger;
pub mod txn;
